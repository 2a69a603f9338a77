//! Rules for the hosted application's console output

use super::rules::{MonitorEvent, OutputRule, RuleSet};
use crate::render::{FRAME_COMPLETE_MARKER, HOST_VERSION_MARKER};
use crate::types::InitData;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::path::{Path, PathBuf};

static HOST_VERSION: Lazy<Regex> = Lazy::new(|| literal_prefix(HOST_VERSION_MARKER, r"\s+(\S+)"));
static FRAME_COMPLETE: Lazy<Regex> = Lazy::new(|| literal_prefix(FRAME_COMPLETE_MARKER, r"\s+(-?[0-9]+)"));
static PROGRESS: Lazy<Regex> = Lazy::new(|| compile(r"\[PROGRESS\] ([0-9]+) percent"));
static ARNOLD_PROGRESS: Lazy<Regex> = Lazy::new(|| compile(r"([0-9]+)% done"));
static RENDERMAN_PROGRESS: Lazy<Regex> = Lazy::new(|| compile(r"R90000\s+([0-9]+)%"));
static MAYA_LICENSE: Lazy<Regex> = Lazy::new(|| {
    compile(&regex::escape(
        "RuntimeError: Error encountered when initializing Maya - Please check for sufficient disk space \
         and necessary write permissions of MAYA_APP_DIR.",
    ))
});
static VRAY_LICENSE: Lazy<Regex> = Lazy::new(|| compile("error: Could not obtain a license"));
static RENDERMAN_LICENSE: Lazy<Regex> = Lazy::new(|| compile(r".*\{SEVERE\}\s+License.*"));
static ARNOLD_LICENSE_ABORT: Lazy<Regex> =
    Lazy::new(|| compile("aborting render because the abort_on_license_fail option was enabled"));
static STRICT_ERROR: Lazy<Regex> = Lazy::new(|| compile(".*Exception:.*|.*Error:.*|.*Warning.*|.*SEVERE.*"));

fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => panic!("built-in output pattern {:?} is invalid: {}", pattern, e),
    }
}

fn literal_prefix(marker: &str, rest: &str) -> Regex {
    compile(&format!("{}{}", regex::escape(marker), rest))
}

fn group<'c>(captures: &'c Captures<'_>, index: usize) -> Result<&'c str, String> {
    captures
        .get(index)
        .map(|m| m.as_str())
        .ok_or_else(|| format!("capture group {} did not participate", index))
}

fn progress(captures: &Captures<'_>) -> Result<MonitorEvent, String> {
    let raw = group(captures, 1)?;
    let value: u32 = raw.parse().map_err(|e| format!("bad progress value '{}': {}", raw, e))?;
    Ok(MonitorEvent::Progress {
        percent: value.min(100) as u8,
    })
}

fn env_or_none(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| "None".to_string())
}

/// Free space in MiB on the filesystem holding `path`
#[cfg(unix)]
fn free_space_mib(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated string and stat is a valid out pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64) / 1024 / 1024)
}

#[cfg(not(unix))]
fn free_space_mib(_path: &Path) -> Option<u64> {
    None
}

fn maya_license_error(captures: &Captures<'_>) -> Result<MonitorEvent, String> {
    let app_dir = std::env::var_os("MAYA_APP_DIR").map(PathBuf::from);
    let checked_dir = match &app_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().map_err(|e| e.to_string())?,
    };
    let free = free_space_mib(&checked_dir)
        .map(|m| format!("{}M", m))
        .unwrap_or_else(|| "unknown".to_string());

    Ok(MonitorEvent::fatal(format!(
        "{}\nThis error is typically associated with a licensing error when using MayaIO. \
         Check your licensing configuration.\nFree disc space: {}\nMAYA_APP_DIR: {}\nADSKFLEX_LICENSE_FILE: {}",
        &captures[0],
        free,
        app_dir.map(|d| d.display().to_string()).unwrap_or_else(|| "None".to_string()),
        env_or_none("ADSKFLEX_LICENSE_FILE"),
    )))
}

fn vray_license_error(captures: &Captures<'_>) -> Result<MonitorEvent, String> {
    Ok(MonitorEvent::fatal(format!(
        "{}\nThis error is typically associated with a licensing error when using Vray renderer with MayaIO. \
         Check your licensing configuration.",
        &captures[0]
    )))
}

fn renderman_license_error(captures: &Captures<'_>) -> Result<MonitorEvent, String> {
    Ok(MonitorEvent::fatal(format!(
        "{}\nThis error is typically associated with a licensing error when using RenderMan. \
         Check your licensing configuration.\nRMANTREE: {}\nPIXAR_LICENSE_FILE: {}",
        &captures[0],
        env_or_none("RMANTREE"),
        env_or_none("PIXAR_LICENSE_FILE"),
    )))
}

fn host_error(captures: &Captures<'_>) -> Result<MonitorEvent, String> {
    Ok(MonitorEvent::fatal(format!(
        "The hosted application encountered an error: {}",
        &captures[0]
    )))
}

/// Rules for a session with the given init data.
///
/// Markers and progress come first, then license failures so their
/// diagnostics win over the generic strict-mode rule.
pub fn builtin_rules(init: &InitData) -> RuleSet {
    let mut rules = RuleSet::new()
        .with(OutputRule::new("host_version", HOST_VERSION.clone(), |c| {
            Ok(MonitorEvent::HostVersion {
                version: group(c, 1)?.to_string(),
            })
        }))
        .with(OutputRule::new("frame_complete", FRAME_COMPLETE.clone(), |c| {
            let raw = group(c, 1)?;
            let frame = raw.parse().map_err(|e| format!("bad frame number '{}': {}", raw, e))?;
            Ok(MonitorEvent::FrameComplete { frame })
        }))
        .with(OutputRule::new("progress", PROGRESS.clone(), progress))
        .with(OutputRule::new("arnold_progress", ARNOLD_PROGRESS.clone(), progress))
        .with(OutputRule::new("renderman_progress", RENDERMAN_PROGRESS.clone(), progress))
        .with(OutputRule::new("maya_license", MAYA_LICENSE.clone(), maya_license_error))
        .with(OutputRule::new("vray_license", VRAY_LICENSE.clone(), vray_license_error))
        .with(OutputRule::new("renderman_license", RENDERMAN_LICENSE.clone(), renderman_license_error));

    if init.error_on_arnold_license_fail.unwrap_or(false) {
        rules.push(OutputRule::new("arnold_license_abort", ARNOLD_LICENSE_ABORT.clone(), host_error));
    }
    if init.strict_error_checking {
        rules.push(OutputRule::new("strict_error", STRICT_ERROR.clone(), host_error));
    }
    rules
}
