use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Lifecycle phase of a batch coordinator. The tag selects which step
/// handler runs; there are no per-state objects.
#[derive(
    Clone, Copy, Debug, Default, Display, PartialEq, Eq, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "PascalCase")]
pub enum BatchState {
    #[default]
    Analyze, // classify the next statement, obtain per-shard fragments
    Handle, // dispatch one sub-client per fragment
    Result, // collect completion signals until the statement resolves
    Quit,   // release sub-clients, mark the coordinator not-alive
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Quit)
    }

    pub fn transitions(&self) -> Vec<BatchState> {
        match self {
            BatchState::Analyze => vec![BatchState::Handle, BatchState::Quit],
            BatchState::Handle => vec![BatchState::Result, BatchState::Quit],
            BatchState::Result => vec![BatchState::Analyze, BatchState::Quit],
            BatchState::Quit => vec![],
        }
    }

    pub fn invalid_transitions(&self) -> Vec<BatchState> {
        let valid = self.transitions();
        BatchState::iter()
            .filter(|s| *s != *self && !valid.contains(s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_is_the_only_terminal_state() {
        for state in BatchState::iter() {
            assert_eq!(state.is_terminal(), state == BatchState::Quit);
        }
    }

    #[test]
    fn every_non_terminal_state_can_quit() {
        for state in BatchState::iter().filter(|s| !s.is_terminal()) {
            assert!(state.transitions().contains(&BatchState::Quit));
        }
    }

    #[test]
    fn resolution_leads_back_to_analyze() {
        assert!(BatchState::Result.transitions().contains(&BatchState::Analyze));
        assert!(BatchState::Result
            .invalid_transitions()
            .contains(&BatchState::Handle));
    }

    #[test]
    fn quit_has_no_way_out() {
        assert!(BatchState::Quit.transitions().is_empty());
        assert_eq!(BatchState::Quit.invalid_transitions().len(), 3);
    }

    #[test]
    fn states_round_trip_through_their_names() {
        use std::str::FromStr;
        for state in BatchState::iter() {
            assert_eq!(BatchState::from_str(&state.to_string()), Ok(state));
        }
        assert_eq!(
            serde_json::to_string(&BatchState::Analyze).unwrap(),
            "\"Analyze\""
        );
    }
}
