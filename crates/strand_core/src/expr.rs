//! Stored value expressions.
//!
//! A compiled expression is a flat list of `(operator, operand)` segments
//! reduced left-to-right against an accumulator. Operands may be literals,
//! shared-storage references, variables, entity data members, or function
//! invocations; operators cover arithmetic, comparison, assignment, member
//! access, and calls.

use tracing::warn;

use crate::hash::{Symbol, TypeId};
use crate::indirect::{resolve_indirect, IndirectDataMember, VariableTarget};
use crate::ops::{self, ValueOperator};
use crate::registry::{Entity, Registry};
use crate::storage::IndirectRef;
use crate::target::EntityTarget;
use crate::value::{self, Value};
use crate::variables::VariableContext;

/// Context threaded through every evaluation: resolved variable scopes plus
/// whatever name resolution the host supplied when building them.
#[derive(Clone, Default)]
pub struct EvaluationContext {
    pub variables: VariableContext,
}

impl EvaluationContext {
    pub fn new(variables: VariableContext) -> Self {
        Self { variables }
    }
}

#[derive(Clone, Debug)]
pub enum Operand {
    Literal(Value),
    SharedRef(IndirectRef),
    Variable(VariableTarget),
    Member(IndirectDataMember),
    EntityRef(EntityTarget),
    /// Member name payload for a `MemberGet` segment.
    MemberName(Symbol),
    /// Function invocation. As a leading operand this is a static call on
    /// the named type; as a `Call` segment it invokes on the accumulator.
    Invoke {
        type_id: TypeId,
        function: Symbol,
        args: Vec<Operand>,
    },
}

#[derive(Clone, Debug)]
pub struct ExprSegment {
    pub op: ValueOperator,
    pub operand: Operand,
}

/// A stored expression tree, flattened.
#[derive(Clone, Debug)]
pub struct ValueExpr {
    pub first: Operand,
    pub rest: Vec<ExprSegment>,
}

impl ValueExpr {
    pub fn literal(value: Value) -> Self {
        Self {
            first: Operand::Literal(value),
            rest: Vec::new(),
        }
    }

    pub fn operand(first: Operand) -> Self {
        Self {
            first,
            rest: Vec::new(),
        }
    }

    pub fn then(mut self, op: ValueOperator, operand: Operand) -> Self {
        self.rest.push(ExprSegment { op, operand });
        self
    }
}

enum WriteTarget {
    Variable(VariableTarget),
    Member(IndirectDataMember),
}

fn write_target(operand: &Operand) -> Option<WriteTarget> {
    match operand {
        Operand::Variable(target) => Some(WriteTarget::Variable(*target)),
        Operand::Member(member) => Some(WriteTarget::Member(*member)),
        _ => None,
    }
}

fn write(
    target: &WriteTarget,
    value: Value,
    registry: &mut Registry,
    entity: Option<Entity>,
    ctx: &EvaluationContext,
) -> bool {
    match target {
        WriteTarget::Variable(variable) => {
            ctx.variables.set(variable.scope, variable.name, value)
        }
        WriteTarget::Member(member) => {
            let Some(resolved) = member.target.resolve(registry, entity) else {
                warn!("assignment target entity did not resolve");
                return false;
            };
            match registry.get_meta_mut(resolved, member.type_id) {
                Some(component) => component.set_member(member.member, value),
                None => {
                    warn!(type_id = member.type_id.0, "assignment target component missing");
                    false
                }
            }
        }
    }
}

fn resolve_operand(
    operand: &Operand,
    registry: &mut Registry,
    entity: Option<Entity>,
    ctx: &EvaluationContext,
) -> Value {
    match operand {
        Operand::Literal(value) => resolve_indirect(value, registry, entity, &ctx.variables),
        Operand::SharedRef(reference) => {
            let wrapped = crate::indirect::indirect_value(*reference);
            resolve_indirect(&wrapped, registry, entity, &ctx.variables)
        }
        Operand::Variable(variable) => ctx
            .variables
            .get(variable.scope, variable.name)
            .map(|v| resolve_indirect(&v, registry, entity, &ctx.variables))
            .unwrap_or_else(Value::empty),
        Operand::Member(member) => member.read(registry, entity),
        Operand::EntityRef(target) => match target.resolve(registry, entity) {
            Some(resolved) => {
                crate::registry::entity_value_type();
                Value::new(resolved)
            }
            None => Value::empty(),
        },
        Operand::MemberName(_) => Value::empty(),
        Operand::Invoke {
            type_id,
            function,
            args,
        } => {
            let argv = resolve_args(args, registry, entity, ctx);
            value::invoke_static(*type_id, *function, &argv)
        }
    }
}

fn resolve_args(
    args: &[Operand],
    registry: &mut Registry,
    entity: Option<Entity>,
    ctx: &EvaluationContext,
) -> Vec<Value> {
    args.iter()
        .map(|a| resolve_operand(a, registry, entity, ctx))
        .collect()
}

/// Evaluate a stored expression. Failure anywhere reduces to an empty value.
pub fn evaluate(
    expr: &ValueExpr,
    registry: &mut Registry,
    entity: Option<Entity>,
    ctx: &EvaluationContext,
) -> Value {
    let mut last_target = write_target(&expr.first);
    let mut acc = resolve_operand(&expr.first, registry, entity, ctx);

    for segment in &expr.rest {
        match segment.op {
            ValueOperator::Assign => {
                let rhs = resolve_operand(&segment.operand, registry, entity, ctx);
                match &last_target {
                    Some(target) => {
                        if !write(target, rhs.clone(), registry, entity, ctx) {
                            warn!("assignment in expression failed");
                        }
                    }
                    None => warn!("assignment with no writable left operand"),
                }
                acc = rhs;
            }
            ValueOperator::MemberGet => match &segment.operand {
                Operand::MemberName(member) => {
                    acc = acc.member(*member);
                    last_target = None;
                }
                other => {
                    warn!(?other, "member access requires a member-name operand");
                    acc = Value::empty();
                }
            },
            ValueOperator::Call => match &segment.operand {
                Operand::Invoke { function, args, .. } => {
                    let argv = resolve_args(args, registry, entity, ctx);
                    acc = acc.invoke(*function, &argv);
                    last_target = None;
                }
                other => {
                    warn!(?other, "call requires an invocation operand");
                    acc = Value::empty();
                }
            },
            op => {
                let rhs = resolve_operand(&segment.operand, registry, entity, ctx);
                acc = ops::apply_binary(op, &acc, &rhs);
                last_target = None;
            }
        }
    }

    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::{shared_store, VariableScope};

    fn local_ctx() -> EvaluationContext {
        EvaluationContext::new(VariableContext {
            local: Some(shared_store()),
            ..Default::default()
        })
    }

    #[test]
    fn test_literal_expression() {
        let mut registry = Registry::new();
        let ctx = local_ctx();
        let expr = ValueExpr::literal(Value::new(21i64))
            .then(ValueOperator::Multiply, Operand::Literal(Value::new(2i64)));
        assert_eq!(evaluate(&expr, &mut registry, None, &ctx).as_i64(), Some(42));
    }

    #[test]
    fn test_left_to_right_reduction() {
        let mut registry = Registry::new();
        let ctx = local_ctx();
        // (2 + 3) * 4 under left-to-right reduction, not precedence.
        let expr = ValueExpr::literal(Value::new(2i64))
            .then(ValueOperator::Add, Operand::Literal(Value::new(3i64)))
            .then(ValueOperator::Multiply, Operand::Literal(Value::new(4i64)));
        assert_eq!(evaluate(&expr, &mut registry, None, &ctx).as_i64(), Some(20));
    }

    #[test]
    fn test_variable_assignment_segment() {
        let mut registry = Registry::new();
        let ctx = local_ctx();
        let target = VariableTarget::new(VariableScope::Local, Symbol::of("hp"));
        let expr = ValueExpr::operand(Operand::Variable(target))
            .then(ValueOperator::Assign, Operand::Literal(Value::new(7i64)));
        let result = evaluate(&expr, &mut registry, None, &ctx);
        assert_eq!(result.as_i64(), Some(7));
        assert_eq!(
            ctx.variables
                .get(VariableScope::Local, Symbol::of("hp"))
                .unwrap()
                .as_i64(),
            Some(7)
        );
    }

    #[test]
    fn test_comparison_result_is_boolean() {
        let mut registry = Registry::new();
        let ctx = local_ctx();
        let expr = ValueExpr::literal(Value::new(5i64))
            .then(ValueOperator::GreaterThan, Operand::Literal(Value::new(3i64)));
        assert_eq!(evaluate(&expr, &mut registry, None, &ctx).as_bool(), Some(true));
    }
}
