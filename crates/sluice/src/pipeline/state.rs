use std::fmt;

/// Per-file pipeline states. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    Detected,
    ChecksumPending,
    Deduplicating,
    Classifying,
    Transforming,
    Uploading,
    Verifying,
    Completed,
    Failed,
}

impl FileState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Completed | FileState::Failed)
    }

    /// Allowed forward moves. `Deduplicating -> Completed` is the skip path;
    /// `Verifying -> Transforming` moves to the next archive entry and
    /// `Transforming -> Completed` finishes an archive with no more entries.
    pub fn can_transition_to(self, next: FileState) -> bool {
        use FileState::*;

        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Detected, ChecksumPending)
                | (ChecksumPending, Deduplicating)
                | (Deduplicating, Classifying)
                | (Deduplicating, Completed)
                | (Classifying, Transforming)
                | (Transforming, Uploading)
                | (Transforming, Completed)
                | (Uploading, Verifying)
                | (Verifying, Transforming)
                | (Verifying, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Detected => "detected",
            FileState::ChecksumPending => "checksum_pending",
            FileState::Deduplicating => "deduplicating",
            FileState::Classifying => "classifying",
            FileState::Transforming => "transforming",
            FileState::Uploading => "uploading",
            FileState::Verifying => "verifying",
            FileState::Completed => "completed",
            FileState::Failed => "failed",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::FileState::*;
    use super::*;

    const ALL: [FileState; 9] = [
        Detected,
        ChecksumPending,
        Deduplicating,
        Classifying,
        Transforming,
        Uploading,
        Verifying,
        Completed,
        Failed,
    ];

    #[test]
    fn test_happy_path_is_allowed() {
        let path = [
            Detected,
            ChecksumPending,
            Deduplicating,
            Classifying,
            Transforming,
            Uploading,
            Verifying,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal_state() {
        for state in ALL {
            assert_eq!(state.can_transition_to(Failed), !state.is_terminal(), "{state}");
        }
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for next in ALL {
            assert!(!Completed.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_no_skipping_stages() {
        assert!(!Detected.can_transition_to(Deduplicating));
        assert!(!ChecksumPending.can_transition_to(Classifying));
        assert!(!Classifying.can_transition_to(Uploading));
        assert!(!Uploading.can_transition_to(Completed));
        assert!(!Verifying.can_transition_to(Uploading));
    }

    #[test]
    fn test_skip_and_archive_loops() {
        assert!(Deduplicating.can_transition_to(Completed));
        assert!(Verifying.can_transition_to(Transforming));
        assert!(Transforming.can_transition_to(Completed));
    }
}
