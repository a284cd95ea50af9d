//! Check records shared by `cos doctor` and `cos config validate`.

use crate::error::CosError;
use dialoguer::console::style;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warn,
    Fail,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
        }
    }

    fn label(self) -> String {
        match self {
            CheckStatus::Ok => style("OK").green().to_string(),
            CheckStatus::Warn => style("WARN").yellow().to_string(),
            CheckStatus::Fail => style("FAIL").red().bold().to_string(),
        }
    }
}

/// One diagnostic finding. Probes report through these instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

impl Check {
    pub fn new(name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
        }
    }

    pub fn ok(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Ok, message)
    }

    pub fn warn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, message)
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub ok: usize,
    pub warn: usize,
    pub fail: usize,
}

impl Summary {
    pub fn exit_code(&self) -> i32 {
        if self.fail > 0 {
            1
        } else {
            0
        }
    }
}

pub fn summarize(checks: &[Check]) -> Summary {
    let mut summary = Summary::default();
    for check in checks {
        match check.status {
            CheckStatus::Ok => summary.ok += 1,
            CheckStatus::Warn => summary.warn += 1,
            CheckStatus::Fail => summary.fail += 1,
        }
    }
    summary
}

/// Prints the report and returns the exit code it implies.
pub fn emit_checks(title: &str, checks: &[Check], as_json: bool) -> Result<i32, CosError> {
    let summary = summarize(checks);
    if as_json {
        print_json(&json!({ "checks": checks, "summary": summary }))?;
        return Ok(summary.exit_code());
    }

    println!("{}", style(title).bold());
    println!();
    for check in checks {
        println!(
            "- [{}] {}: {}",
            check.status.label(),
            check.name,
            check.message.trim()
        );
    }
    println!();
    println!(
        "Summary: ok={} warn={} fail={}",
        summary.ok, summary.warn, summary.fail
    );
    Ok(summary.exit_code())
}

pub fn print_json<T: Serialize>(payload: &T) -> Result<(), CosError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
