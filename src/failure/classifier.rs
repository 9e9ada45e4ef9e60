use std::sync::LazyLock;

use regex::Regex;

use crate::config::RetryPolicy;

use super::{
    Confidence, FailureAnalysis, FailureCategory, FailureContext, RecoveryStrategy,
};

static API_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)anthropic|claude|overloaded|rate.?limit|too many requests|\b429\b|\b529\b|quota|api.?key|invalid_request_error|server_error|billing",
    )
    .expect("api pattern compiles")
});

static NETWORK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)ECONNREFUSED|ENOTFOUND|ECONNRESET|EPIPE|ETIMEDOUT|EAI_AGAIN|socket hang up|connection refused|connection reset|network is unreachable|could not resolve",
    )
    .expect("network pattern compiles")
});

static TIMEOUT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)timed?.?out|timeout|deadline exceeded").expect("timeout pattern compiles")
});

static GIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bgit\b|non-fast-forward|index\.lock|cannot lock ref|refusing to merge|unrelated histories|detached HEAD|pathspec",
    )
    .expect("git pattern compiles")
});

/// When elapsed time reaches this share of the budget, treat it as a timeout.
const TIMEOUT_ELAPSED_RATIO: f64 = 0.9;

/// Classify a failure. Pure: never errors, never touches the environment.
///
/// The rules are evaluated top-down and the first match wins:
/// 1. judge rejection (terminal)
/// 2–3. API / rate-limit errors: bounded retry, then terminal exhaustion
/// 4. uncommitted or untracked work: auto-commit and continue to judge
/// 5. commits on the branch: salvage straight to judge
/// 6. network errors: bounded retry, then salvage
/// 7. timeouts: bounded retry with more time, then salvage
/// 8. git errors: bounded immediate retry, then salvage
/// 9. unknown: bounded retry, then salvage as last resort
pub fn classify(ctx: &FailureContext, policy: &RetryPolicy) -> FailureAnalysis {
    let retries = ctx.retries_attempted;
    let backoff_ms = policy.backoff_delay(retries).as_millis() as u64;
    let mut evidence = vec![format!(
        "phase={} retries={} error={}",
        ctx.phase,
        retries,
        truncate(&ctx.error, 200)
    )];

    // Rule 1: judge said no; that is an answer, not a failure to recover from.
    if ctx.judge_rejected {
        return FailureAnalysis {
            category: FailureCategory::JudgeRejected,
            strategy: RecoveryStrategy::Accept,
            is_terminal: true,
            should_retry: false,
            should_call_judge: false,
            retry_delay_ms: 0,
            max_additional_retries: 0,
            evidence,
            recommendations: vec!["preserve the branch for human review".into()],
            confidence: Confidence::High,
        };
    }

    // Rules 2–3: upstream model / rate-limit errors.
    if API_PATTERN.is_match(&ctx.error) {
        evidence.push("error text matches API/rate-limit pattern".into());
        if retries < policy.api_retries {
            return FailureAnalysis {
                category: FailureCategory::ApiError,
                strategy: RecoveryStrategy::RetryWithBackoff,
                is_terminal: false,
                should_retry: true,
                should_call_judge: false,
                retry_delay_ms: backoff_ms,
                max_additional_retries: policy.api_retries - retries,
                evidence,
                recommendations: vec![format!("wait {}ms before retrying", backoff_ms)],
                confidence: Confidence::High,
            };
        }
        return FailureAnalysis {
            category: FailureCategory::ApiExhausted,
            strategy: RecoveryStrategy::Accept,
            is_terminal: true,
            should_retry: false,
            should_call_judge: false,
            retry_delay_ms: 0,
            max_additional_retries: 0,
            evidence,
            recommendations: vec!["upstream model unavailable; report terminal failure".into()],
            confidence: Confidence::High,
        };
    }

    // Rule 4: uncommitted work in the tree beats everything network-shaped;
    // the work exists, it just was never committed.
    if let Some(detection) = &ctx.workspace_detection
        && (detection.has_uncommitted_files || detection.has_untracked_files)
    {
        evidence.push(format!(
            "workspace has {} uncommitted and {} untracked files",
            detection.uncommitted.len(),
            detection.untracked.len()
        ));
        return FailureAnalysis {
            category: FailureCategory::UncommittedWork,
            strategy: RecoveryStrategy::AutoCommitAndContinue,
            is_terminal: false,
            should_retry: false,
            should_call_judge: true,
            retry_delay_ms: 0,
            max_additional_retries: 0,
            evidence,
            recommendations: vec![
                "auto-commit the working tree and route the branch to the judge".into(),
            ],
            confidence: Confidence::Medium,
        };
    }

    // Rule 5: the branch already has commits; git is the truth, judge them.
    if ctx.has_commits_on_branch == Some(true) {
        evidence.push("branch has commits beyond the epic base".into());
        return FailureAnalysis {
            category: FailureCategory::UnpushedWork,
            strategy: RecoveryStrategy::SalvageAndJudge,
            is_terminal: false,
            should_retry: false,
            should_call_judge: true,
            retry_delay_ms: 0,
            max_additional_retries: 0,
            evidence,
            recommendations: vec!["skip the developer and evaluate the existing commits".into()],
            confidence: Confidence::Medium,
        };
    }

    // Rule 6: network faults.
    if NETWORK_PATTERN.is_match(&ctx.error) {
        evidence.push("error text matches network pattern".into());
        if retries < policy.network_retries {
            return FailureAnalysis {
                category: FailureCategory::NetworkTransient,
                strategy: RecoveryStrategy::RetryWithBackoff,
                is_terminal: false,
                should_retry: true,
                should_call_judge: false,
                retry_delay_ms: backoff_ms,
                max_additional_retries: policy.network_retries - retries,
                evidence,
                recommendations: vec![format!("wait {}ms before retrying", backoff_ms)],
                confidence: Confidence::High,
            };
        }
        return salvage(
            FailureCategory::NetworkTransient,
            evidence,
            "network retries exhausted; check for salvageable work",
        );
    }

    // Rule 7: timeouts, by pattern or by elapsed-vs-budget ratio.
    let elapsed_signals_timeout = match (ctx.elapsed_ms, ctx.timeout_ms) {
        (Some(elapsed), Some(budget)) if budget > 0 => {
            elapsed as f64 >= budget as f64 * TIMEOUT_ELAPSED_RATIO
        }
        _ => false,
    };
    if TIMEOUT_PATTERN.is_match(&ctx.error) || elapsed_signals_timeout {
        if elapsed_signals_timeout {
            evidence.push(format!(
                "elapsed {}ms is >= 90% of the {}ms budget",
                ctx.elapsed_ms.unwrap_or(0),
                ctx.timeout_ms.unwrap_or(0)
            ));
        } else {
            evidence.push("error text matches timeout pattern".into());
        }
        if retries < policy.timeout_retries {
            return FailureAnalysis {
                category: FailureCategory::Timeout,
                strategy: RecoveryStrategy::RetryWithMoreTime,
                is_terminal: false,
                should_retry: true,
                should_call_judge: false,
                retry_delay_ms: 0,
                max_additional_retries: policy.timeout_retries - retries,
                evidence,
                recommendations: vec!["re-run with an increased timeout".into()],
                confidence: Confidence::High,
            };
        }
        return salvage(
            FailureCategory::Timeout,
            evidence,
            "timeout retries exhausted; check for salvageable work",
        );
    }

    // Rule 8: git failures retry immediately (lock contention clears fast).
    if GIT_PATTERN.is_match(&ctx.error) {
        evidence.push("error text matches git pattern".into());
        if retries < policy.git_retries {
            return FailureAnalysis {
                category: FailureCategory::GitTransient,
                strategy: RecoveryStrategy::RetryImmediate,
                is_terminal: false,
                should_retry: true,
                should_call_judge: false,
                retry_delay_ms: 0,
                max_additional_retries: policy.git_retries - retries,
                evidence,
                recommendations: vec!["retry the git operation immediately".into()],
                confidence: Confidence::High,
            };
        }
        return salvage(
            FailureCategory::GitTransient,
            evidence,
            "git retries exhausted; check for salvageable work",
        );
    }

    // Rule 9: unknown.
    evidence.push("no pattern matched".into());
    if retries < policy.unknown_retries {
        return FailureAnalysis {
            category: FailureCategory::Unknown,
            strategy: RecoveryStrategy::RetryWithBackoff,
            is_terminal: false,
            should_retry: true,
            should_call_judge: false,
            retry_delay_ms: backoff_ms,
            max_additional_retries: policy.unknown_retries - retries,
            evidence,
            recommendations: vec![format!("wait {}ms before retrying", backoff_ms)],
            confidence: Confidence::Low,
        };
    }
    let mut analysis = salvage(
        FailureCategory::Unknown,
        evidence,
        "retries exhausted on an unclassified error; salvage as last resort",
    );
    analysis.confidence = Confidence::Low;
    analysis
}

fn salvage(
    category: FailureCategory,
    evidence: Vec<String>,
    recommendation: &str,
) -> FailureAnalysis {
    FailureAnalysis {
        category,
        strategy: RecoveryStrategy::SalvageAndJudge,
        is_terminal: false,
        should_retry: false,
        should_call_judge: true,
        retry_delay_ms: 0,
        max_additional_retries: 0,
        evidence,
        recommendations: vec![recommendation.to_string()],
        confidence: Confidence::Medium,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
