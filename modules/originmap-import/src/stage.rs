//! Stage gate: which stages run inline, and where the pipeline stops.

use std::collections::BTreeSet;

use originmap_common::{CompanyRecord, Stage};

use crate::seed::is_valid_seed_company;

/// Why a request was rejected before any stage ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRejection {
    /// `skip_stages` includes primary but no usable seed companies were
    /// supplied — resuming downstream stages without primary results is
    /// nonsensical. Retryable with a corrected request (409-equivalent).
    MissingSeedCompanies,
    /// `max_stage` caps at a non-terminal stage without `dry_run` — the run
    /// would silently skip persistence, which is disallowed (400-equivalent).
    NonTerminalCapWithoutDryRun(Stage),
}

#[derive(Debug, Clone, Default)]
pub struct StageGate {
    max_stage: Option<Stage>,
    skip: BTreeSet<Stage>,
}

impl StageGate {
    pub fn new(max_stage: Option<Stage>, skip: impl IntoIterator<Item = Stage>) -> Self {
        Self {
            max_stage,
            skip: skip.into_iter().collect(),
        }
    }

    pub fn should_run(&self, stage: Stage) -> bool {
        if self.skip.contains(&stage) {
            return false;
        }
        match self.max_stage {
            None => true,
            Some(max) => stage <= max,
        }
    }

    pub fn should_stop_after(&self, stage: Stage) -> bool {
        self.max_stage == Some(stage)
    }

    pub fn skips_primary(&self) -> bool {
        self.skip.contains(&Stage::Primary)
    }

    pub fn max_stage(&self) -> Option<Stage> {
        self.max_stage
    }

    /// Fail-fast request validation, run before the budget clock matters.
    pub fn validate(&self, seeds: &[CompanyRecord], dry_run: bool) -> Result<(), GateRejection> {
        if let Some(max) = self.max_stage {
            let terminal_cap = matches!(max, Stage::Primary | Stage::Expand);
            if !terminal_cap && !dry_run {
                return Err(GateRejection::NonTerminalCapWithoutDryRun(max));
            }
        }

        if self.skips_primary() && !seeds.iter().any(is_valid_seed_company) {
            return Err(GateRejection::MissingSeedCompanies);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_stage_caps_later_stages() {
        let gate = StageGate::new(Some(Stage::Keywords), []);
        assert!(gate.should_run(Stage::Primary));
        assert!(gate.should_run(Stage::Keywords));
        assert!(!gate.should_run(Stage::Reviews));
        assert!(!gate.should_run(Stage::Expand));
    }

    #[test]
    fn max_expand_runs_everything() {
        let gate = StageGate::new(Some(Stage::Expand), []);
        for stage in Stage::ALL {
            assert!(gate.should_run(stage));
        }
    }

    #[test]
    fn skip_wins_over_max_stage() {
        let gate = StageGate::new(Some(Stage::Expand), [Stage::Primary]);
        assert!(!gate.should_run(Stage::Primary));
        assert!(gate.should_run(Stage::Keywords));
    }

    #[test]
    fn stop_after_only_at_max() {
        let gate = StageGate::new(Some(Stage::Keywords), []);
        assert!(!gate.should_stop_after(Stage::Primary));
        assert!(gate.should_stop_after(Stage::Keywords));

        let ungated = StageGate::default();
        assert!(!ungated.should_stop_after(Stage::Expand));
    }

    #[test]
    fn skip_primary_without_seeds_is_rejected() {
        let gate = StageGate::new(None, [Stage::Primary]);
        assert_eq!(
            gate.validate(&[], false),
            Err(GateRejection::MissingSeedCompanies)
        );
    }

    #[test]
    fn skip_primary_with_stored_seed_passes() {
        let gate = StageGate::new(None, [Stage::Primary]);
        let seed = CompanyRecord {
            id: Some("company_123".to_string()),
            company_name: "Acme".to_string(),
            website_url: "https://acme.com".to_string(),
            ..Default::default()
        };
        assert!(gate.validate(&[seed], false).is_ok());
    }

    #[test]
    fn non_terminal_cap_requires_dry_run() {
        let gate = StageGate::new(Some(Stage::Reviews), []);
        assert_eq!(
            gate.validate(&[], false),
            Err(GateRejection::NonTerminalCapWithoutDryRun(Stage::Reviews))
        );
        assert!(gate.validate(&[], true).is_ok());

        let primary_cap = StageGate::new(Some(Stage::Primary), []);
        assert!(primary_cap.validate(&[], false).is_ok());
        let expand_cap = StageGate::new(Some(Stage::Expand), []);
        assert!(expand_cap.validate(&[], false).is_ok());
    }
}
