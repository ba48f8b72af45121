use crate::error::{Error, Result};
use crate::matches::batch_minor_linear::MatchBatchMinorLinear;
use crate::matches::expression::ExpressionMatcher;
use crate::matches::fuse_activation::{FuseFilterActivation, FuseOpActivation};
use crate::matches::matcher::{MatchGroup, Matcher};
use crate::matches::missing_quantization::FindMissingQuantization;
use crate::matches::pattern::Declarative;
use crate::matches::remove_noops::RemoveNoops;
use crate::matches::remove_reshapes::RemoveReshapes;
use crate::quantization::qtype::QScheme;

pub fn scale8_match_group() -> MatchGroup {
    MatchGroup::new("scale8_match_group", "fusions for scaled 8-bit kernels")
        .add(RemoveNoops)
        .add(Declarative(RemoveReshapes))
        .add(Declarative(MatchBatchMinorLinear))
        .add(Declarative(FuseFilterActivation { scheme: QScheme::Scaled }))
        .add(Declarative(FuseOpActivation { scheme: QScheme::Scaled }))
        .add(ExpressionMatcher)
        .add(FindMissingQuantization)
}

pub fn pow2_match_group() -> MatchGroup {
    MatchGroup::new("pow2_match_group", "fusions for power-of-two kernels")
        .add(RemoveNoops)
        .add(Declarative(RemoveReshapes))
        .add(Declarative(FuseFilterActivation { scheme: QScheme::Pow2 }))
        .add(Declarative(FuseOpActivation { scheme: QScheme::Pow2 }))
        .add(FindMissingQuantization)
}

pub fn match_group_for(scheme: QScheme) -> MatchGroup {
    match scheme {
        QScheme::Scaled => scale8_match_group(),
        QScheme::Pow2 => pow2_match_group(),
    }
}

fn all() -> Vec<Box<dyn Matcher>> {
    vec![
        Box::new(scale8_match_group()),
        Box::new(pow2_match_group()),
        Box::new(RemoveNoops),
        Box::new(Declarative(RemoveReshapes)),
        Box::new(Declarative(MatchBatchMinorLinear)),
        Box::new(Declarative(FuseFilterActivation { scheme: QScheme::Scaled })),
        Box::new(Declarative(FuseOpActivation { scheme: QScheme::Scaled })),
        Box::new(Declarative(FuseOpActivation { scheme: QScheme::Pow2 })),
        Box::new(ExpressionMatcher),
        Box::new(FindMissingQuantization),
    ]
}

/// A pass or match group by name.
pub fn get_fusion(name: &str) -> Result<Box<dyn Matcher>> {
    all().into_iter().find(|m| m.name() == name).ok_or_else(|| Error::UnknownMatcher(name.to_string()))
}

/// Names and descriptions of every pass and match group.
pub fn get_fusions() -> Vec<(String, String)> {
    all().iter().map(|m| (m.name().to_string(), m.description().to_string())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_names_are_unique() {
        let names: Vec<_> = get_fusions().into_iter().map(|(name, _)| name).collect();
        let unique: std::collections::BTreeSet<_> = names.iter().collect();
        assert_eq!(names.len(), unique.len());
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(get_fusion("expression_matcher").unwrap().name(), "expression_matcher");
        assert!(matches!(get_fusion("nope"), Err(Error::UnknownMatcher(_))));
    }

    #[test]
    fn activation_fusion_runs_before_finalization() {
        let group = scale8_match_group();
        let names: Vec<_> = group.passes().map(|p| p.name().to_string()).collect();
        let pos = |n: &str| names.iter().position(|x| x == n).unwrap();
        assert!(pos("remove_noops") < pos("fuse_filter_activation"));
        assert!(pos("fuse_op_activation_scale8") < pos("find_missing_quantization"));
    }
}
