/// Capability filtering: decides which advertised cooperative matrix
/// variants this harness can safely benchmark.
///
/// Four rules are checked in order; the first one that fails skips the
/// variant:
///   1. Execution scope must be subgroup
///   2. Operand A and B types must match
///   3. Every type code must be inside the VkComponentTypeKHR range
///   4. Accumulator type must equal the result type
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::variant::{
    component_name, scope_name, ComponentType, EligibleVariant, Scope, VariantDescriptor,
};

/// Which operand a type field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    A,
    B,
    C,
    Result,
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::A => write!(f, "a"),
            Operand::B => write!(f, "b"),
            Operand::C => write!(f, "c"),
            Operand::Result => write!(f, "d"),
        }
    }
}

/// Why a variant was not forwarded for benchmarking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Only subgroup scope is supported.
    UnsupportedScope { scope: i32 },
    /// s8 x u8 style mixes are exposed by some drivers but fail.
    MixedOperandTypes { a: i32, b: i32 },
    /// Driver reported a code outside VkComponentTypeKHR.
    InvalidComponentType { operand: Operand, raw: i32 },
    /// Accumulator and result types differ.
    AccumulatorResultMismatch { c: i32, result: i32 },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::UnsupportedScope { scope } => {
                write!(f, "only subgroup scope supported (got {})", scope_name(*scope))
            }
            SkipReason::MixedOperandTypes { a, b } => write!(
                f,
                "known buggy mixed operand types ({} x {})",
                component_name(*a),
                component_name(*b)
            ),
            SkipReason::InvalidComponentType { operand, raw } => {
                write!(f, "unsupported {} type (value={})", operand, raw)
            }
            SkipReason::AccumulatorResultMismatch { c, result } => write!(
                f,
                "accumulator type {} differs from result type {}",
                component_name(*c),
                component_name(*result)
            ),
        }
    }
}

/// Apply the four eligibility rules to one descriptor.
pub fn check(
    desc: &VariantDescriptor,
    subgroup_size: u32,
) -> Result<EligibleVariant, SkipReason> {
    // Rule 1: scope
    if Scope::from_raw(desc.scope) != Some(Scope::Subgroup) {
        return Err(SkipReason::UnsupportedScope { scope: desc.scope });
    }

    // Rule 2: matching operand types
    if desc.a_type != desc.b_type {
        return Err(SkipReason::MixedOperandTypes {
            a: desc.a_type,
            b: desc.b_type,
        });
    }

    // Rule 3: every type code in range
    let typed = |operand, raw| {
        ComponentType::from_raw(raw).ok_or(SkipReason::InvalidComponentType { operand, raw })
    };
    let a_type = typed(Operand::A, desc.a_type)?;
    let b_type = typed(Operand::B, desc.b_type)?;
    let c_type = typed(Operand::C, desc.c_type)?;
    typed(Operand::Result, desc.result_type)?;

    // Rule 4: accumulator == result
    if desc.c_type != desc.result_type {
        return Err(SkipReason::AccumulatorResultMismatch {
            c: desc.c_type,
            result: desc.result_type,
        });
    }

    Ok(EligibleVariant {
        descriptor: *desc,
        a_type,
        b_type,
        c_type,
        subgroup_size,
    })
}

/// A skipped variant together with the rule it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skipped {
    pub descriptor: VariantDescriptor,
    pub reason: SkipReason,
}

/// Result of filtering one device's advertised variants.
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub eligible: Vec<EligibleVariant>,
    pub skipped: Vec<Skipped>,
}

/// Split a device's advertised variants into eligible and skipped ones,
/// logging each decision. Order of the input is preserved in both lists.
pub fn filter(advertised: &[VariantDescriptor], subgroup_size: u32) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();
    for desc in advertised {
        match check(desc, subgroup_size) {
            Ok(variant) => {
                debug!("eligible: {}", desc.table_row());
                outcome.eligible.push(variant);
            }
            Err(reason) => {
                info!("skipping {}: {}", desc.table_row(), reason);
                outcome.skipped.push(Skipped {
                    descriptor: *desc,
                    reason,
                });
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::Tile;

    fn desc(a: i32, b: i32, c: i32, d: i32, scope: Scope) -> VariantDescriptor {
        VariantDescriptor {
            tile: Tile::new(16, 16, 16),
            a_type: a,
            b_type: b,
            c_type: c,
            result_type: d,
            scope: scope as i32,
            saturating: false,
        }
    }

    const F16: i32 = ComponentType::F16 as i32;
    const F32: i32 = ComponentType::F32 as i32;
    const S8: i32 = ComponentType::S8 as i32;
    const U8: i32 = ComponentType::U8 as i32;
    const S32: i32 = ComponentType::S32 as i32;

    #[test]
    fn subgroup_f16_is_eligible() {
        let v = check(&desc(F16, F16, F32, F32, Scope::Subgroup), 32).unwrap();
        assert_eq!(v.a_type, ComponentType::F16);
        assert_eq!(v.c_type, ComponentType::F32);
        assert_eq!(v.subgroup_size, 32);
    }

    #[test]
    fn non_subgroup_scopes_are_skipped() {
        for scope in [Scope::Device, Scope::Workgroup, Scope::QueueFamily] {
            let err = check(&desc(F16, F16, F16, F16, scope), 32).unwrap_err();
            assert_eq!(err, SkipReason::UnsupportedScope { scope: scope as i32 });
        }
    }

    #[test]
    fn mixed_signedness_is_skipped() {
        let err = check(&desc(S8, U8, S32, S32, Scope::Subgroup), 64).unwrap_err();
        assert_eq!(err, SkipReason::MixedOperandTypes { a: S8, b: U8 });
    }

    #[test]
    fn scope_rule_wins_over_later_rules() {
        // Bad scope and mixed types: the first failing rule is reported.
        let err = check(&desc(S8, U8, S32, F16, Scope::Device), 64).unwrap_err();
        assert!(matches!(err, SkipReason::UnsupportedScope { .. }));
    }

    #[test]
    fn garbage_type_codes_are_skipped() {
        let err = check(&desc(F16, F16, 1_000_142_000, 1_000_142_000, Scope::Subgroup), 32)
            .unwrap_err();
        assert_eq!(
            err,
            SkipReason::InvalidComponentType {
                operand: Operand::C,
                raw: 1_000_142_000
            }
        );
        assert!(err.to_string().contains("unsupported c type"));
    }

    #[test]
    fn accumulator_result_mismatch_is_skipped() {
        let err = check(&desc(F16, F16, F32, F16, Scope::Subgroup), 32).unwrap_err();
        assert_eq!(err, SkipReason::AccumulatorResultMismatch { c: F32, result: F16 });
    }

    #[test]
    fn filter_preserves_order_and_partitions() {
        let advertised = [
            desc(F16, F16, F16, F16, Scope::Subgroup),
            desc(F16, F16, F16, F16, Scope::Device),
            desc(S8, S8, S32, S32, Scope::Subgroup),
        ];
        let outcome = filter(&advertised, 32);
        assert_eq!(outcome.eligible.len(), 2);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.eligible[0].a_type, ComponentType::F16);
        assert_eq!(outcome.eligible[1].a_type, ComponentType::S8);
        assert_eq!(outcome.skipped[0].descriptor, advertised[1]);
    }
}
