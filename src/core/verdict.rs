use std::fmt;
use std::str::FromStr;

use crate::constants::{CORRECT_EXITCODE, WRONG_ANSWER_EXITCODE};
use crate::core::meta::{CompareMetadata, ExecutionMetadata};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    Correct,
    WrongAnswer,
    Timelimit,
    RunError,
    OutputLimit,
    NoOutput,
    CompareError,
    InternalError,
}

impl Verdict {
    pub const ALL: [Verdict; 8] = [
        Verdict::Correct,
        Verdict::WrongAnswer,
        Verdict::Timelimit,
        Verdict::RunError,
        Verdict::OutputLimit,
        Verdict::NoOutput,
        Verdict::CompareError,
        Verdict::InternalError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Correct => "correct",
            Verdict::WrongAnswer => "wrong-answer",
            Verdict::Timelimit => "timelimit",
            Verdict::RunError => "run-error",
            Verdict::OutputLimit => "output-limit",
            Verdict::NoOutput => "no-output",
            Verdict::CompareError => "compare-error",
            Verdict::InternalError => "internal-error",
        }
    }

    /// Verdicts that mean the judging infrastructure, not the submission, failed.
    pub fn is_system_error(self) -> bool {
        matches!(self, Verdict::CompareError | Verdict::InternalError)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown verdict `{0}`")]
pub struct UnknownVerdict(pub String);

impl FromStr for Verdict {
    type Err = UnknownVerdict;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verdict::ALL
            .into_iter()
            .find(|verdict| verdict.as_str() == s)
            .ok_or_else(|| UnknownVerdict(s.to_string()))
    }
}

/// Everything the verdict rules look at for one testcase.
#[derive(Clone, Debug, PartialEq)]
pub struct VerdictInput {
    pub program_meta: ExecutionMetadata,
    pub compare_meta: CompareMetadata,
    pub compare_exitcode: i32,
    pub combined_run_compare: bool,
    pub program_out_size: u64,
    pub compare_timed_out: bool,
}

/// An interactive validator that already rejected the run wins the race
/// against a program that then timed out or crashed.
fn validator_rejected_first(
    compare_meta: &CompareMetadata,
    compare_exitcode: i32,
    combined_run_compare: bool,
) -> bool {
    combined_run_compare
        && compare_meta.validator_exited_first
        && compare_exitcode == WRONG_ANSWER_EXITCODE
}

/// Resolves the run and compare signals of one testcase into a verdict.
///
/// Rules are checked in order and the first match wins:
/// a broken or timed out comparator, a time limit, a non-zero exit code,
/// truncated stdout, empty output (non-interactive only), and finally the
/// comparator's own answer.
pub fn determine_verdict(input: &VerdictInput) -> Verdict {
    let VerdictInput {
        program_meta,
        compare_meta,
        compare_exitcode,
        combined_run_compare,
        program_out_size,
        compare_timed_out,
    } = input;
    let compare_exitcode = *compare_exitcode;

    if *compare_timed_out
        || (compare_exitcode != CORRECT_EXITCODE && compare_exitcode != WRONG_ANSWER_EXITCODE)
    {
        return Verdict::CompareError;
    }

    let wrong_answer_first =
        validator_rejected_first(compare_meta, compare_exitcode, *combined_run_compare);

    if program_meta.time_result.is_timelimit() {
        return if wrong_answer_first {
            Verdict::WrongAnswer
        } else {
            Verdict::Timelimit
        };
    }

    if program_meta.exit_code != 0 {
        return if wrong_answer_first {
            Verdict::WrongAnswer
        } else {
            Verdict::RunError
        };
    }

    if program_meta.output_truncated.stdout {
        return Verdict::OutputLimit;
    }

    if *program_out_size == 0 && !combined_run_compare {
        return Verdict::NoOutput;
    }

    match compare_exitcode {
        CORRECT_EXITCODE => Verdict::Correct,
        WRONG_ANSWER_EXITCODE => Verdict::WrongAnswer,
        _ => Verdict::CompareError,
    }
}

/// Human readable explanation of `verdict`.
///
/// `filesize_limit` is the output limit in kB. Nothing is returned for
/// system errors, whose details are for the logs only.
pub fn verdict_message(
    verdict: Verdict,
    program_meta: &ExecutionMetadata,
    compare_meta: &CompareMetadata,
    combined_run_compare: bool,
    filesize_limit: u64,
) -> Option<String> {
    match verdict {
        Verdict::Correct => Some("Correct!".to_string()),
        Verdict::WrongAnswer => {
            let raced = combined_run_compare && compare_meta.validator_exited_first;
            let message = if raced && program_meta.time_result.is_timelimit() {
                "Timelimit exceeded, but validator exited first with WA. Wrong answer!".to_string()
            } else if raced && program_meta.exit_code != 0 {
                format!(
                    "Non-zero exitcode {}, but validator exited first with WA. Wrong answer!",
                    program_meta.exit_code
                )
            } else {
                "Wrong answer!".to_string()
            };
            Some(message)
        }
        Verdict::Timelimit => Some("Timelimit exceeded.".to_string()),
        Verdict::RunError => Some(format!("Non-zero exitcode {}", program_meta.exit_code)),
        Verdict::OutputLimit => Some(format!(
            "Output limit exceeded: {} bytes more than the limit of {} bytes",
            program_meta.stdout_bytes,
            filesize_limit.saturating_mul(1024)
        )),
        Verdict::NoOutput => Some("Program produced no output.".to_string()),
        Verdict::CompareError | Verdict::InternalError => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::meta::{OutputTruncated, TimeResult};

    fn nominal_program_meta() -> ExecutionMetadata {
        ExecutionMetadata {
            exit_code: 0,
            cpu_time: Duration::from_millis(100),
            wall_time: Duration::from_millis(200),
            memory_bytes: 1048576,
            ..Default::default()
        }
    }

    struct Case {
        program_meta: ExecutionMetadata,
        validator_exited_first: bool,
        compare_exitcode: i32,
        combined_run_compare: bool,
        program_out_size: u64,
        compare_timed_out: bool,
    }

    impl Default for Case {
        fn default() -> Self {
            Case {
                program_meta: nominal_program_meta(),
                validator_exited_first: false,
                compare_exitcode: 42,
                combined_run_compare: false,
                program_out_size: 100,
                compare_timed_out: false,
            }
        }
    }

    impl Case {
        fn input(self) -> VerdictInput {
            VerdictInput {
                program_meta: self.program_meta,
                compare_meta: CompareMetadata {
                    exit_code: self.compare_exitcode,
                    validator_exited_first: self.validator_exited_first,
                },
                compare_exitcode: self.compare_exitcode,
                combined_run_compare: self.combined_run_compare,
                program_out_size: self.program_out_size,
                compare_timed_out: self.compare_timed_out,
            }
        }
    }

    fn judge(input: &VerdictInput) -> (Verdict, Option<String>) {
        let verdict = determine_verdict(input);
        let message = verdict_message(
            verdict,
            &input.program_meta,
            &input.compare_meta,
            input.combined_run_compare,
            100,
        );
        (verdict, message)
    }

    fn timed_out(time_result: TimeResult, exit_code: i32) -> ExecutionMetadata {
        ExecutionMetadata {
            time_result,
            exit_code,
            ..nominal_program_meta()
        }
    }

    fn exited(exit_code: i32) -> ExecutionMetadata {
        ExecutionMetadata {
            exit_code,
            ..nominal_program_meta()
        }
    }

    #[test]
    fn test_correct() {
        let input = Case::default().input();
        assert_eq!(
            judge(&input),
            (Verdict::Correct, Some("Correct!".to_string()))
        );
    }

    #[test]
    fn test_wrong_answer() {
        let input = Case {
            compare_exitcode: 43,
            ..Default::default()
        }
        .input();
        assert_eq!(
            judge(&input),
            (Verdict::WrongAnswer, Some("Wrong answer!".to_string()))
        );
    }

    #[test]
    fn test_timelimit_hard_and_soft() {
        for time_result in [TimeResult::Hard, TimeResult::Soft] {
            let input = Case {
                program_meta: timed_out(time_result, 137),
                compare_exitcode: 43,
                ..Default::default()
            }
            .input();
            assert_eq!(
                judge(&input),
                (Verdict::Timelimit, Some("Timelimit exceeded.".to_string()))
            );
        }
    }

    #[test]
    fn test_timelimit_wins_over_run_error() {
        let input = Case {
            program_meta: timed_out(TimeResult::Hard, 139),
            compare_exitcode: 43,
            ..Default::default()
        }
        .input();
        assert_eq!(determine_verdict(&input), Verdict::Timelimit);
    }

    #[test]
    fn test_run_error() {
        let input = Case {
            program_meta: exited(1),
            compare_exitcode: 43,
            ..Default::default()
        }
        .input();
        assert_eq!(
            judge(&input),
            (Verdict::RunError, Some("Non-zero exitcode 1".to_string()))
        );
    }

    #[test]
    fn test_run_error_wins_over_output_limit() {
        let input = Case {
            program_meta: ExecutionMetadata {
                output_truncated: OutputTruncated {
                    stdout: true,
                    stderr: false,
                },
                ..exited(1)
            },
            compare_exitcode: 43,
            ..Default::default()
        }
        .input();
        assert_eq!(
            judge(&input),
            (Verdict::RunError, Some("Non-zero exitcode 1".to_string()))
        );
    }

    #[test]
    fn test_output_limit() {
        let input = Case {
            program_meta: ExecutionMetadata {
                output_truncated: OutputTruncated {
                    stdout: true,
                    stderr: false,
                },
                stdout_bytes: 1024,
                ..nominal_program_meta()
            },
            compare_exitcode: 43,
            ..Default::default()
        }
        .input();
        assert_eq!(
            judge(&input),
            (
                Verdict::OutputLimit,
                Some("Output limit exceeded: 1024 bytes more than the limit of 102400 bytes".to_string())
            )
        );
    }

    #[test]
    fn test_stderr_truncation_is_not_an_output_limit() {
        let input = Case {
            program_meta: ExecutionMetadata {
                output_truncated: OutputTruncated {
                    stdout: false,
                    stderr: true,
                },
                stderr_bytes: 67108864,
                ..nominal_program_meta()
            },
            compare_exitcode: 43,
            ..Default::default()
        }
        .input();
        assert_eq!(
            judge(&input),
            (Verdict::WrongAnswer, Some("Wrong answer!".to_string()))
        );
    }

    #[test]
    fn test_no_output() {
        let input = Case {
            compare_exitcode: 43,
            program_out_size: 0,
            ..Default::default()
        }
        .input();
        assert_eq!(
            judge(&input),
            (
                Verdict::NoOutput,
                Some("Program produced no output.".to_string())
            )
        );
    }

    #[test]
    fn test_no_output_is_left_to_interactive_validator() {
        let input = Case {
            compare_exitcode: 43,
            combined_run_compare: true,
            program_out_size: 0,
            ..Default::default()
        }
        .input();
        assert_eq!(
            judge(&input),
            (Verdict::WrongAnswer, Some("Wrong answer!".to_string()))
        );

        let input = Case {
            combined_run_compare: true,
            program_out_size: 0,
            ..Default::default()
        }
        .input();
        assert_eq!(determine_verdict(&input), Verdict::Correct);
    }

    #[test]
    fn test_compare_error_on_unknown_exitcode() {
        for compare_exitcode in [0, 1, 41, 44, 137, -1] {
            let input = Case {
                compare_exitcode,
                ..Default::default()
            }
            .input();
            assert_eq!(judge(&input), (Verdict::CompareError, None));
        }
    }

    #[test]
    fn test_compare_timeout_wins_over_everything() {
        let inputs = [
            Case {
                compare_timed_out: true,
                ..Default::default()
            },
            Case {
                program_meta: timed_out(TimeResult::Hard, 137),
                compare_exitcode: 43,
                compare_timed_out: true,
                ..Default::default()
            },
            Case {
                program_meta: exited(1),
                program_out_size: 0,
                compare_timed_out: true,
                ..Default::default()
            },
        ];
        for case in inputs {
            assert_eq!(judge(&case.input()), (Verdict::CompareError, None));
        }
    }

    #[test]
    fn test_validator_exited_first_overrides_timelimit() {
        let input = Case {
            program_meta: timed_out(TimeResult::Hard, 137),
            validator_exited_first: true,
            compare_exitcode: 43,
            combined_run_compare: true,
            ..Default::default()
        }
        .input();
        assert_eq!(
            judge(&input),
            (
                Verdict::WrongAnswer,
                Some("Timelimit exceeded, but validator exited first with WA. Wrong answer!".to_string())
            )
        );
    }

    #[test]
    fn test_validator_exited_first_overrides_run_error() {
        for exit_code in [1, 139] {
            let input = Case {
                program_meta: exited(exit_code),
                validator_exited_first: true,
                compare_exitcode: 43,
                combined_run_compare: true,
                ..Default::default()
            }
            .input();
            assert_eq!(
                judge(&input),
                (
                    Verdict::WrongAnswer,
                    Some(format!(
                        "Non-zero exitcode {}, but validator exited first with WA. Wrong answer!",
                        exit_code
                    ))
                )
            );
        }
    }

    #[test]
    fn test_validator_exited_first_does_not_override_when_correct() {
        let input = Case {
            program_meta: timed_out(TimeResult::Hard, 137),
            validator_exited_first: true,
            compare_exitcode: 42,
            combined_run_compare: true,
            ..Default::default()
        }
        .input();
        assert_eq!(
            judge(&input),
            (Verdict::Timelimit, Some("Timelimit exceeded.".to_string()))
        );
    }

    #[test]
    fn test_validator_exited_first_ignored_outside_interactive_mode() {
        let input = Case {
            program_meta: timed_out(TimeResult::Hard, 137),
            validator_exited_first: true,
            compare_exitcode: 43,
            combined_run_compare: false,
            ..Default::default()
        }
        .input();
        assert_eq!(
            judge(&input),
            (Verdict::Timelimit, Some("Timelimit exceeded.".to_string()))
        );
    }

    #[test]
    fn test_interactive_without_race_keeps_timelimit() {
        let input = Case {
            program_meta: timed_out(TimeResult::Soft, 137),
            validator_exited_first: false,
            compare_exitcode: 43,
            combined_run_compare: true,
            ..Default::default()
        }
        .input();
        assert_eq!(determine_verdict(&input), Verdict::Timelimit);
    }

    #[test]
    fn test_interactive_race_with_clean_program_exit() {
        let input = Case {
            validator_exited_first: true,
            compare_exitcode: 43,
            combined_run_compare: true,
            ..Default::default()
        }
        .input();
        assert_eq!(
            judge(&input),
            (Verdict::WrongAnswer, Some("Wrong answer!".to_string()))
        );
    }

    #[test]
    fn test_determination_is_reproducible() {
        let cases = [
            Case::default(),
            Case {
                program_meta: timed_out(TimeResult::Hard, 137),
                validator_exited_first: true,
                compare_exitcode: 43,
                combined_run_compare: true,
                ..Default::default()
            },
            Case {
                program_meta: exited(3),
                program_out_size: 0,
                compare_exitcode: 43,
                ..Default::default()
            },
        ];
        for case in cases {
            let input = case.input();
            let copy = input.clone();
            assert_eq!(determine_verdict(&input), determine_verdict(&copy));
            assert_eq!(input, copy);
        }
    }

    #[test]
    fn test_verdict_names_round_trip() {
        for verdict in Verdict::ALL {
            assert_eq!(verdict.to_string().parse::<Verdict>(), Ok(verdict));
        }
        assert!("memory-limit".parse::<Verdict>().is_err());
    }
}
