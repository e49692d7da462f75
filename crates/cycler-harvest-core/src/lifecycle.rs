//! File lifecycle state machine.
//!
//! Pure transition functions over [`ObservedFile`]. The report handler is the
//! only caller that persists their results, which keeps the server the single
//! authority on file state.
//!
//! ```text
//!  first report ──▶ UNSTABLE ◀── size shrank
//!                      │  ▲
//!          size grew   ▼  │ size shrank
//!                    GROWING
//!                      │ size unchanged for ≥ stable_time
//!                      ▼
//!                    STABLE ──begin──▶ IMPORTING ──complete──▶ IMPORTED
//!                      ▲                   │
//!   reimport ──▶ RETRY_IMPORT ──begin──────┘ failed ──▶ IMPORT_FAILED
//! ```
//!
//! An unchanged size observed before the window has elapsed keeps the
//! current state: a GROWING file stays GROWING and an UNSTABLE file stays
//! UNSTABLE until the window passes and it becomes STABLE.

use chrono::{DateTime, Utc};

use crate::error::ReportError;
use crate::models::{FileState, ObservedFile};

/// Result of applying one event to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Changed { from: FileState, to: FileState },
}

impl Transition {
    pub fn changed(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

fn move_to(file: &mut ObservedFile, to: FileState) -> Transition {
    let from = file.state;
    if from == to {
        return Transition::Unchanged;
    }
    file.state = to;
    Transition::Changed { from, to }
}

/// Apply a `file_size` observation.
///
/// A size change records the new size and resets the observation time. An
/// unchanged size promotes the file to STABLE once `stable_time` seconds have
/// passed since the last change, as seen by a strictly later observation.
/// Before that it keeps its current state. IMPORTED and IMPORT_FAILED are
/// never demoted by an unchanged size, and a pending RETRY_IMPORT request is
/// kept.
///
/// The returned flag is true when any stored field changed.
pub fn observe_size(
    file: &mut ObservedFile,
    size: u64,
    now: DateTime<Utc>,
    stable_time: u64,
) -> (Transition, bool) {
    if size != file.last_observed_size {
        let to = if size < file.last_observed_size {
            FileState::Unstable
        } else {
            FileState::Growing
        };
        file.last_observed_size = size;
        file.last_observed_time = now;
        return (move_to(file, to), true);
    }

    let elapsed_ms = (now - file.last_observed_time).num_milliseconds();
    if elapsed_ms <= 0 || (elapsed_ms as u64) < stable_time.saturating_mul(1000) {
        return (Transition::Unchanged, false);
    }

    match file.state {
        FileState::Imported | FileState::ImportFailed | FileState::RetryImport => {
            (Transition::Unchanged, false)
        }
        _ => {
            let transition = move_to(file, FileState::Stable);
            (transition, transition.changed())
        }
    }
}

/// `import: begin`: only STABLE and RETRY_IMPORT files may start importing.
pub fn begin_import(file: &mut ObservedFile) -> Result<Transition, ReportError> {
    match file.state {
        FileState::Stable | FileState::RetryImport => Ok(move_to(file, FileState::Importing)),
        other => Err(ReportError::Conflict(format!(
            "cannot begin import of '{}' while it is {}",
            file.path, other
        ))),
    }
}

/// `import: complete`: IMPORTING becomes IMPORTED; anything else is a no-op.
pub fn complete_import(file: &mut ObservedFile) -> Transition {
    if file.state == FileState::Importing {
        move_to(file, FileState::Imported)
    } else {
        Transition::Unchanged
    }
}

/// `import: failed`, or any error raised while ingesting a chunk.
pub fn fail_import(file: &mut ObservedFile) -> Transition {
    move_to(file, FileState::ImportFailed)
}

/// Operator reimport, accepted from every state.
pub fn force_retry(file: &mut ObservedFile) -> Transition {
    move_to(file, FileState::RetryImport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewObservedFile;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn new_file(size: u64, at: DateTime<Utc>) -> ObservedFile {
        NewObservedFile {
            harvester_id: 1,
            path: "/data/cell.csv".to_string(),
            size,
            observed_at: at,
        }
        .into_file(1)
    }

    #[test]
    fn test_empty_file_with_zero_window_becomes_stable() {
        let mut file = new_file(0, t(0));
        assert_eq!(file.state, FileState::Unstable);
        observe_size(&mut file, 0, t(1), 0);
        assert_eq!(file.state, FileState::Stable);
    }

    #[test]
    fn test_growth_then_stability() {
        let mut file = new_file(100, t(0));
        let (transition, _) = observe_size(&mut file, 150, t(1), 10);
        assert_eq!(
            transition,
            Transition::Changed {
                from: FileState::Unstable,
                to: FileState::Growing
            }
        );
        assert_eq!(file.last_observed_time, t(1));

        observe_size(&mut file, 150, t(5), 10);
        assert_eq!(file.state, FileState::Growing);

        observe_size(&mut file, 150, t(11), 10);
        assert_eq!(file.state, FileState::Stable);
    }

    #[test]
    fn test_shrink_forces_unstable() {
        let mut file = new_file(100, t(0));
        observe_size(&mut file, 100, t(100), 10);
        assert_eq!(file.state, FileState::Stable);
        let (_, dirty) = observe_size(&mut file, 40, t(101), 10);
        assert!(dirty);
        assert_eq!(file.state, FileState::Unstable);
        assert_eq!(file.last_observed_size, 40);
    }

    #[test]
    fn test_terminal_states_are_not_demoted_to_stable() {
        for state in [FileState::Imported, FileState::ImportFailed, FileState::RetryImport] {
            let mut file = new_file(10, t(0));
            file.state = state;
            observe_size(&mut file, 10, t(1000), 10);
            assert_eq!(file.state, state);
        }
    }

    #[test]
    fn test_interrupted_import_becomes_stable_again() {
        let mut file = new_file(10, t(0));
        file.state = FileState::Importing;
        observe_size(&mut file, 10, t(1000), 10);
        assert_eq!(file.state, FileState::Stable);
    }

    #[test]
    fn test_import_transitions() {
        let mut file = new_file(10, t(0));
        assert!(begin_import(&mut file).is_err());

        file.state = FileState::Stable;
        assert!(begin_import(&mut file).unwrap().changed());
        assert_eq!(file.state, FileState::Importing);

        assert!(complete_import(&mut file).changed());
        assert_eq!(file.state, FileState::Imported);
        assert_eq!(complete_import(&mut file), Transition::Unchanged);

        force_retry(&mut file);
        assert_eq!(file.state, FileState::RetryImport);
        begin_import(&mut file).unwrap();
        fail_import(&mut file);
        assert_eq!(file.state, FileState::ImportFailed);
    }

    /// Reference model of the size rules, written independently of `observe_size`.
    fn expected_state(
        prev_state: FileState,
        prev_size: u64,
        prev_time: i64,
        size: u64,
        now: i64,
        window: u64,
    ) -> FileState {
        if size < prev_size {
            FileState::Unstable
        } else if size > prev_size {
            FileState::Growing
        } else if now > prev_time
            && (now - prev_time) as u64 >= window
            && !matches!(
                prev_state,
                FileState::Imported | FileState::ImportFailed | FileState::RetryImport
            )
        {
            FileState::Stable
        } else {
            prev_state
        }
    }

    proptest! {
        #[test]
        fn prop_size_sequence_follows_transition_table(
            steps in prop::collection::vec((0u64..5, 0i64..4), 1..40),
            window in 0u64..6,
        ) {
            let mut now = 0i64;
            let mut size = 0u64;
            let mut file = new_file(size, t(now));
            for (delta, dt) in steps {
                // grow, repeat, or shrink depending on `delta`
                let next = match delta {
                    0 => size.saturating_sub(7),
                    1 | 2 => size,
                    _ => size + delta,
                };
                now += dt;
                let prev_time = (file.last_observed_time - t(0)).num_seconds();
                let expected = expected_state(file.state, size, prev_time, next, now, window);
                observe_size(&mut file, next, t(now), window);
                prop_assert_eq!(file.state, expected);
                prop_assert_eq!(file.last_observed_size, next);
                size = next;
            }
        }

        #[test]
        fn prop_repeated_report_is_idempotent(
            sizes in prop::collection::vec(0u64..50, 1..20),
            gaps in prop::collection::vec(0i64..5, 20),
            window in 0u64..6,
        ) {
            let mut file = new_file(0, t(0));
            let mut now = 0i64;
            for (size, gap) in sizes.iter().zip(gaps.iter()) {
                now += gap;
                observe_size(&mut file, *size, t(now), window);
                let after_first = file.clone();
                let (transition, dirty) = observe_size(&mut file, *size, t(now), window);
                prop_assert_eq!(transition, Transition::Unchanged);
                prop_assert!(!dirty);
                prop_assert_eq!(&file, &after_first);
            }
        }
    }
}
