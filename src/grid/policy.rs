// src/grid/policy.rs

//! User job policy: periodic and on-exit hold/release/remove predicates.

use super::ad::{attr, AdValue, JobAd, LocalStatus};
use super::expr::{Expression, Value};

/// Hold reason codes written alongside policy holds.
pub const HOLD_CODE_JOB_POLICY: i64 = 3;
pub const HOLD_CODE_JOB_POLICY_UNDEFINED: i64 = 5;

/// What a policy evaluation asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    StaysInQueue,
    Hold { reason: String },
    Remove { reason: String },
    /// Left to the schedd; the gridmanager does nothing.
    Release,
    /// A policy expression could not be evaluated; the job is held.
    Undefined { reason: String },
}

/// Outcome of one policy attribute.
enum Check {
    /// Attribute absent.
    Unset,
    Is(bool, String),
    Undefined(String),
}

fn check(ad: &JobAd, name: &str, now: i64) -> Check {
    let source = match ad.get(name) {
        None | Some(AdValue::Undefined) => return Check::Unset,
        Some(AdValue::Bool(b)) => return Check::Is(*b, b.to_string()),
        Some(AdValue::Int(i)) => return Check::Is(*i != 0, i.to_string()),
        Some(AdValue::Float(f)) => return Check::Is(*f != 0.0, f.to_string()),
        Some(AdValue::Str(s)) => s.clone(),
    };
    let value = match Expression::parse(&source) {
        Ok(expr) => expr.eval(ad, now),
        Err(_) => Value::Undefined,
    };
    match value.as_bool() {
        Some(b) => Check::Is(b, source),
        None => Check::Undefined(source),
    }
}

fn true_reason(name: &str, source: &str) -> String {
    format!("The job attribute {name} expression '{source}' evaluated to TRUE")
}

fn undefined_reason(name: &str, source: &str) -> String {
    format!("undefined job policy expression: {name} = {source}")
}

/// Evaluate `PeriodicRemove`, then `PeriodicHold` (not held) or
/// `PeriodicRelease` (held).
pub fn eval_periodic(ad: &JobAd, now: i64) -> PolicyVerdict {
    match check(ad, attr::PERIODIC_REMOVE, now) {
        Check::Is(true, src) => {
            return PolicyVerdict::Remove {
                reason: true_reason(attr::PERIODIC_REMOVE, &src),
            };
        }
        Check::Undefined(src) => {
            return PolicyVerdict::Undefined {
                reason: undefined_reason(attr::PERIODIC_REMOVE, &src),
            };
        }
        _ => {}
    }

    if ad.local_status() == Some(LocalStatus::Held) {
        return match check(ad, attr::PERIODIC_RELEASE, now) {
            Check::Is(true, _) => PolicyVerdict::Release,
            _ => PolicyVerdict::StaysInQueue,
        };
    }

    match check(ad, attr::PERIODIC_HOLD, now) {
        Check::Is(true, src) => PolicyVerdict::Hold {
            reason: true_reason(attr::PERIODIC_HOLD, &src),
        },
        Check::Undefined(src) => PolicyVerdict::Undefined {
            reason: undefined_reason(attr::PERIODIC_HOLD, &src),
        },
        _ => PolicyVerdict::StaysInQueue,
    }
}

/// Evaluate the periodic expressions, then `OnExitHold` and
/// `OnExitRemove` (which defaults to true). `Remove` here means the job
/// leaves the queue as completed; `StaysInQueue` means it runs again.
pub fn eval_on_exit(ad: &JobAd, now: i64) -> PolicyVerdict {
    match eval_periodic(ad, now) {
        PolicyVerdict::StaysInQueue | PolicyVerdict::Release => {}
        other => return other,
    }

    match check(ad, attr::ON_EXIT_HOLD, now) {
        Check::Is(true, src) => {
            return PolicyVerdict::Hold {
                reason: true_reason(attr::ON_EXIT_HOLD, &src),
            };
        }
        Check::Undefined(src) => {
            return PolicyVerdict::Undefined {
                reason: undefined_reason(attr::ON_EXIT_HOLD, &src),
            };
        }
        _ => {}
    }

    match check(ad, attr::ON_EXIT_REMOVE, now) {
        Check::Unset | Check::Is(true, _) => PolicyVerdict::Remove {
            reason: "Job exited".to_string(),
        },
        Check::Is(false, _) => PolicyVerdict::StaysInQueue,
        Check::Undefined(src) => PolicyVerdict::Undefined {
            reason: undefined_reason(attr::ON_EXIT_REMOVE, &src),
        },
    }
}
