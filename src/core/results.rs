use std::collections::HashMap;

use crate::core::verdict::Verdict;

/// Priorities used to pick one final result out of many testcase verdicts.
///
/// A higher priority wins; with equal priority the earliest testcase wins.
/// System errors are not configurable and outrank everything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultPriorities {
    priorities: HashMap<Verdict, u32>,
}

impl Default for ResultPriorities {
    fn default() -> Self {
        ResultPriorities::new([
            (Verdict::OutputLimit, 99),
            (Verdict::RunError, 99),
            (Verdict::Timelimit, 99),
            (Verdict::WrongAnswer, 30),
            (Verdict::NoOutput, 10),
            (Verdict::Correct, 1),
        ])
    }
}

impl ResultPriorities {
    pub fn new(priorities: impl IntoIterator<Item = (Verdict, u32)>) -> Self {
        ResultPriorities {
            priorities: priorities
                .into_iter()
                .filter(|(verdict, _)| !verdict.is_system_error())
                .collect(),
        }
    }

    fn max_configured(&self) -> u32 {
        self.priorities.values().copied().max().unwrap_or(0)
    }

    pub fn priority(&self, verdict: Verdict) -> u32 {
        if verdict.is_system_error() {
            return u32::MAX;
        }
        self.priorities.get(&verdict).copied().unwrap_or(0)
    }
}

/// Final result of a judging given the verdicts known so far, in rank order.
///
/// `None` entries are testcases that have not been judged yet. Returns `None`
/// while an unjudged testcase could still change the outcome.
pub fn final_result(results: &[Option<Verdict>], priorities: &ResultPriorities) -> Option<Verdict> {
    let mut best: Option<(Verdict, u32)> = None;
    let mut have_missing = false;

    for result in results {
        let Some(verdict) = result else {
            have_missing = true;
            break;
        };
        let priority = priorities.priority(*verdict);
        if best.is_none_or(|(_, best_priority)| priority > best_priority) {
            best = Some((*verdict, priority));
        }
    }

    match best {
        Some((_, priority)) if have_missing && priority < priorities.max_configured() => None,
        None if have_missing => None,
        best => best.map(|(verdict, _)| verdict),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use Verdict::*;

    #[test]
    fn test_all_correct() {
        let results = [Some(Correct), Some(Correct), Some(Correct)];
        assert_eq!(
            final_result(&results, &ResultPriorities::default()),
            Some(Correct)
        );
    }

    #[test]
    fn test_highest_priority_wins() {
        let results = [Some(Correct), Some(NoOutput), Some(WrongAnswer), Some(Correct)];
        assert_eq!(
            final_result(&results, &ResultPriorities::default()),
            Some(WrongAnswer)
        );
    }

    #[test]
    fn test_first_of_equal_priority_wins() {
        let results = [Some(Correct), Some(RunError), Some(Timelimit)];
        assert_eq!(
            final_result(&results, &ResultPriorities::default()),
            Some(RunError)
        );
    }

    #[test]
    fn test_unknown_while_missing_results_could_matter() {
        let results = [Some(Correct), Some(WrongAnswer), None, Some(Timelimit)];
        assert_eq!(final_result(&results, &ResultPriorities::default()), None);
        assert_eq!(final_result(&[None, None], &ResultPriorities::default()), None);
    }

    #[test]
    fn test_known_early_with_maximal_priority() {
        let results = [Some(Correct), Some(Timelimit), None, None];
        assert_eq!(
            final_result(&results, &ResultPriorities::default()),
            Some(Timelimit)
        );
    }

    #[test]
    fn test_system_errors_outrank_everything() {
        let results = [Some(Timelimit), Some(CompareError), None];
        assert_eq!(
            final_result(&results, &ResultPriorities::default()),
            Some(CompareError)
        );

        let results = [Some(Correct), Some(InternalError)];
        assert_eq!(
            final_result(&results, &ResultPriorities::default()),
            Some(InternalError)
        );
    }

    #[test]
    fn test_custom_priorities() {
        let priorities = ResultPriorities::new([(NoOutput, 37), (Correct, 1)]);
        let results = [Some(Correct), Some(NoOutput), None];
        assert_eq!(final_result(&results, &priorities), Some(NoOutput));
        assert_eq!(priorities.priority(WrongAnswer), 0);
        assert_eq!(priorities.priority(InternalError), u32::MAX);
    }

    #[test]
    fn test_empty_judging_has_no_result() {
        assert_eq!(final_result(&[], &ResultPriorities::default()), None);
    }
}
