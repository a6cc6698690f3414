//! Binary program format header.
//!
//! The compiled archetype-to-VM format opens with this header. The parser
//! itself lives in the authoring toolchain; the header layout is part of the
//! core contract because descriptors embed it and loaders verify it.

use serde::{Deserialize, Serialize};

pub type FormatVersion = u16;
pub type FormatFlags = u16;

/// Bitfield indicating which elements are present in the binary sequence.
pub mod format_flags {
    use super::FormatFlags;

    /// Initial bit is reserved.
    pub const RESERVED: FormatFlags = 1 << 0;
    /// Integral and floating-point types stored big-endian.
    pub const BIG_ENDIAN: FormatFlags = 1 << 1;
    /// Unannotated layouts may be memcopied when the endian matches.
    pub const ALLOW_TRIVIAL_COPY: FormatFlags = 1 << 2;
    /// Objects carry a standard format header before their value segment.
    pub const STANDARD_HEADER: FormatFlags = 1 << 3;
    /// Encoded objects specify their intended type id.
    pub const TYPE_ID_HEADER: FormatFlags = 1 << 4;
    /// Member values are preceded by their type identifiers.
    pub const MEMBER_TYPES: FormatFlags = 1 << 5;
    /// Object segments are length-prefixed.
    pub const LENGTH_HEADER: FormatFlags = 1 << 6;
    /// Each member entry is length-prefixed.
    pub const MEMBER_LENGTHS: FormatFlags = 1 << 7;
    /// A member count precedes the member sequence.
    pub const COUNT_MEMBERS: FormatFlags = 1 << 8;
    /// Member identifiers are encoded before their values.
    pub const MEMBER_NAMES: FormatFlags = 1 << 9;
    /// Read-only members are included in the sequence.
    pub const READ_ONLY_MEMBERS: FormatFlags = 1 << 10;

    /// Flags that introduce per-member annotations into the stream.
    pub const ANNOTATION_FILTER: FormatFlags =
        MEMBER_TYPES | MEMBER_LENGTHS | MEMBER_NAMES | COUNT_MEMBERS;
}

/// String encoding used by the binary format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StringFormat {
    #[default]
    Utf8 = 0,
    Utf16 = 1,
    Utf32 = 2,
}

/// `{format_version, format_flags, string_format}` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryFormatConfig {
    pub format_version: FormatVersion,
    pub format: FormatFlags,
    pub string_format: StringFormat,
}

impl BinaryFormatConfig {
    pub const FORMAT_V1: FormatFlags = format_flags::STANDARD_HEADER
        | format_flags::LENGTH_HEADER
        | format_flags::TYPE_ID_HEADER;

    pub const DEFAULT_FORMAT: FormatFlags = Self::FORMAT_V1;

    /// Accept any format version.
    pub const ANY_FORMAT_VERSION: FormatVersion = 0;

    pub fn any_format() -> Self {
        Self {
            format_version: Self::ANY_FORMAT_VERSION,
            format: Self::DEFAULT_FORMAT,
            string_format: StringFormat::default(),
        }
    }

    pub fn get_flag(&self, flag: FormatFlags) -> bool {
        (self.format & flag) != 0
    }

    pub fn set_flag(&mut self, flag: FormatFlags, value: bool) -> &mut Self {
        if value {
            self.format |= flag;
        } else {
            self.format &= !flag;
        }
        self
    }

    pub fn big_endian(&self) -> bool {
        self.get_flag(format_flags::BIG_ENDIAN)
    }

    pub fn standard_header(&self) -> bool {
        self.get_flag(format_flags::STANDARD_HEADER)
    }

    pub fn type_id_header(&self) -> bool {
        self.get_flag(format_flags::TYPE_ID_HEADER)
    }

    pub fn length_header(&self) -> bool {
        self.get_flag(format_flags::LENGTH_HEADER)
    }

    pub fn member_types(&self) -> bool {
        self.get_flag(format_flags::MEMBER_TYPES)
    }

    pub fn member_lengths(&self) -> bool {
        self.get_flag(format_flags::MEMBER_LENGTHS)
    }

    pub fn count_members(&self) -> bool {
        self.get_flag(format_flags::COUNT_MEMBERS)
    }

    pub fn member_ids(&self) -> bool {
        self.get_flag(format_flags::MEMBER_NAMES)
    }

    pub fn read_only_members(&self) -> bool {
        self.get_flag(format_flags::READ_ONLY_MEMBERS)
    }

    /// An object is annotated when formatting elements would prevent a 1:1
    /// copy of its data.
    pub fn is_annotated(&self) -> bool {
        (self.format & format_flags::ANNOTATION_FILTER) != 0
    }

    pub fn is_unannotated(&self) -> bool {
        !self.is_annotated()
    }

    /// Whether trivial copying of objects is permitted. Implementations are
    /// free to forgo it regardless.
    pub fn can_trivially_copy(&self) -> bool {
        let endian_matches = cfg!(target_endian = "big") || !self.big_endian();
        endian_matches
            && self.get_flag(format_flags::ALLOW_TRIVIAL_COPY)
            && self.is_unannotated()
    }

    /// Header for nested member values: the outer standard header decays,
    /// and member-level annotations become object-level ones.
    pub fn decay(&self) -> Self {
        let mut decayed = *self;
        decayed.set_flag(format_flags::STANDARD_HEADER, false);
        let member_types = self.member_types();
        let member_lengths = self.member_lengths();
        decayed.set_flag(format_flags::TYPE_ID_HEADER, member_types);
        decayed.set_flag(format_flags::LENGTH_HEADER, member_lengths);
        decayed
    }
}

impl Default for BinaryFormatConfig {
    fn default() -> Self {
        Self {
            format_version: 1,
            format: Self::DEFAULT_FORMAT,
            string_format: StringFormat::default(),
        }
    }
}
