//! Condition evaluator: branches execution on prior engagement.
//!
//! When open or click tracking is disabled in the sequence settings, the
//! corresponding ledger entries are treated as permanently false: a
//! `not_opened` condition under `track_opens = false` always branches, and
//! an `opened` condition never does. Signals that were never collected can
//! never gate a branch, stray recorded events included.

use cadence_core::{ConditionKind, EngagementLedger, SequenceSettings, StepCondition};

/// Evaluate a condition step. Returns the step number execution branches to:
/// the condition's target when the check passes, `current_step + 1` when it
/// falls through.
pub fn evaluate(
    condition: &StepCondition,
    ledger: &EngagementLedger,
    settings: &SequenceSettings,
    current_step: u32,
) -> u32 {
    let opened = settings.track_opens && ledger.opened(condition.reference_step);
    let clicked = settings.track_clicks && ledger.clicked(condition.reference_step);

    let pass = match condition.kind {
        ConditionKind::Opened => opened,
        ConditionKind::Clicked => clicked,
        ConditionKind::NotOpened => !opened,
        ConditionKind::NotClicked => !clicked,
    };

    if pass {
        condition.branch_to
    } else {
        current_step + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(kind: ConditionKind, reference_step: u32, branch_to: u32) -> StepCondition {
        StepCondition {
            kind,
            reference_step,
            branch_to,
        }
    }

    #[test]
    fn test_opened_branches_on_open() {
        let settings = SequenceSettings::default();
        let mut ledger = EngagementLedger::default();
        ledger.record_open(2);

        let c = cond(ConditionKind::Opened, 2, 7);
        assert_eq!(evaluate(&c, &ledger, &settings, 3), 7);

        // Ledger false → fall through to the next step
        let empty = EngagementLedger::default();
        assert_eq!(evaluate(&c, &empty, &settings, 3), 4);
    }

    #[test]
    fn test_not_clicked_inverts() {
        let settings = SequenceSettings::default();
        let mut ledger = EngagementLedger::default();

        let c = cond(ConditionKind::NotClicked, 1, 5);
        assert_eq!(evaluate(&c, &ledger, &settings, 2), 5);

        ledger.record_click(1);
        assert_eq!(evaluate(&c, &ledger, &settings, 2), 3);
    }

    #[test]
    fn test_disabled_tracking_reads_as_never_opened() {
        let settings = SequenceSettings {
            track_opens: false,
            ..SequenceSettings::default()
        };
        // A stray open event was recorded anyway
        let mut ledger = EngagementLedger::default();
        ledger.record_open(1);

        // not_opened always branches as if step 1 was never opened
        let c = cond(ConditionKind::NotOpened, 1, 9);
        assert_eq!(evaluate(&c, &ledger, &settings, 4), 9);

        // opened never branches
        let c = cond(ConditionKind::Opened, 1, 9);
        assert_eq!(evaluate(&c, &ledger, &settings, 4), 5);
    }
}
