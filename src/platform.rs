//! Side effects the assistant can have on the host: launching apps, opening
//! links, placing calls.

use crate::{Error, Result};
use dialoguer::Select;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use wait_timeout::ChildExt;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    CallPhone,
    ReadPhoneState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing,
    OffHook,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledApp {
    pub name: String,
    pub package: String,
}

/// Host integration used by the action handlers
#[cfg_attr(test, mockall::automock)]
pub trait Platform: Send + Sync {
    fn launch_app(&self, package: &str) -> Result<()>;

    fn open_url(&self, url: &str) -> Result<()>;

    /// Whether something is registered to handle `url`
    fn can_open(&self, url: &str) -> bool;

    /// Send an intent-style action such as `CONNECT` to `package`
    fn send_action(&self, package: &str, action: &str) -> Result<()>;

    fn has_permission(&self, permission: Permission) -> bool;

    fn start_call(&self, number: &str) -> Result<()>;

    fn call_state(&self) -> Result<CallState>;

    fn open_accessibility_settings(&self) -> Result<()>;

    fn installed_apps(&self) -> Result<Vec<InstalledApp>>;

    /// Let the user choose one of `apps`. `None` when dismissed.
    fn pick_app(&self, prompt: &str, apps: &[InstalledApp]) -> Result<Option<InstalledApp>>;
}

/// An app choice handed to whoever reads the terminal
#[derive(Debug)]
pub struct PickRequest {
    pub prompt: String,
    pub apps: Vec<InstalledApp>,
    reply: oneshot::Sender<Option<InstalledApp>>,
}

impl PickRequest {
    /// Answer with one typed line. See [`parse_choice`].
    pub fn answer(self, line: &str) {
        let choice = parse_choice(line, &self.apps);
        let _ = self.reply.send(choice);
    }
}

/// A 1-based list number or an app name (case-insensitive). Anything else,
/// including a blank line, picks nothing.
pub fn parse_choice(line: &str, apps: &[InstalledApp]) -> Option<InstalledApp> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Ok(n) = line.parse::<usize>() {
        return n.checked_sub(1).and_then(|i| apps.get(i)).cloned();
    }
    apps.iter()
        .find(|a| a.name.eq_ignore_ascii_case(line) || a.package.eq_ignore_ascii_case(line))
        .cloned()
}

/// Linux desktop implementation backed by freedesktop tools
pub struct DesktopPlatform {
    application_dirs: Vec<PathBuf>,
    /// Set when the terminal already has a line reader; choices go through it
    /// instead of an interactive menu
    line_picker: Option<mpsc::UnboundedSender<PickRequest>>,
}

impl Default for DesktopPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl DesktopPlatform {
    pub fn new() -> Self {
        // User entries shadow system ones
        let mut application_dirs: Vec<PathBuf> = dirs::data_dir()
            .map(|data| data.join("applications"))
            .into_iter()
            .collect();
        application_dirs.push(PathBuf::from("/usr/share/applications"));
        Self::with_application_dirs(application_dirs)
    }

    pub fn with_application_dirs(application_dirs: Vec<PathBuf>) -> Self {
        Self {
            application_dirs,
            line_picker: None,
        }
    }

    /// Route [`Platform::pick_app`] through the returned channel. The
    /// receiver answers each [`PickRequest`] with a line the user typed.
    pub fn with_line_picker(mut self) -> (Self, mpsc::UnboundedReceiver<PickRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.line_picker = Some(tx);
        (self, rx)
    }
}

fn run(program: &str, args: &[&str]) -> Result<Output> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::ActionExecutionFailure(format!("{}: {}", program, e)))?;

    match child.wait_timeout(COMMAND_TIMEOUT)? {
        Some(_) => Ok(child.wait_with_output()?),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(Error::Timeout(format!(
                "{} timed out after {}s",
                program,
                COMMAND_TIMEOUT.as_secs()
            )))
        }
    }
}

fn run_ok(program: &str, args: &[&str]) -> Result<()> {
    let output = run(program, args)?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::ActionExecutionFailure(format!(
            "{} failed: {}",
            program,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

impl Platform for DesktopPlatform {
    fn launch_app(&self, package: &str) -> Result<()> {
        tracing::info!(package, "launching app");
        run_ok("gtk-launch", &[package])
    }

    fn open_url(&self, url: &str) -> Result<()> {
        tracing::info!(url, "opening url");
        run_ok("xdg-open", &[url])
    }

    fn can_open(&self, url: &str) -> bool {
        let Some((scheme, _)) = url.split_once(':') else {
            return false;
        };
        let mime = format!("x-scheme-handler/{}", scheme.to_lowercase());
        match run("xdg-mime", &["query", "default", &mime]) {
            Ok(out) => {
                out.status.success() && !String::from_utf8_lossy(&out.stdout).trim().is_empty()
            }
            Err(_) => false,
        }
    }

    fn send_action(&self, package: &str, action: &str) -> Result<()> {
        let verb = match action {
            "CONNECT" => "up",
            "DISCONNECT" => "down",
            other => {
                return Err(Error::ActionExecutionFailure(format!(
                    "unsupported action {}",
                    other
                )))
            }
        };
        tracing::info!(connection = package, verb, "vpn control");
        run_ok("nmcli", &["connection", verb, "id", package])
    }

    fn has_permission(&self, permission: Permission) -> bool {
        match permission {
            Permission::CallPhone => self.can_open("tel:"),
            // No telephony stack to ask on a desktop
            Permission::ReadPhoneState => false,
        }
    }

    fn start_call(&self, number: &str) -> Result<()> {
        self.open_url(&format!("tel:{}", number))
    }

    fn call_state(&self) -> Result<CallState> {
        Err(Error::ActionExecutionFailure(
            "call state is not available on this host".to_string(),
        ))
    }

    fn open_accessibility_settings(&self) -> Result<()> {
        run_ok("gnome-control-center", &["universal-access"])
    }

    fn installed_apps(&self) -> Result<Vec<InstalledApp>> {
        let mut apps: Vec<InstalledApp> = Vec::new();
        for dir in &self.application_dirs {
            scan_applications(dir, &mut apps);
        }
        // Earlier directories win when the same entry is installed twice
        let mut seen = std::collections::HashSet::new();
        apps.retain(|a| seen.insert(a.package.clone()));
        apps.sort_by_key(|a| a.name.to_lowercase());
        Ok(apps)
    }

    /// Blocks until the user answers; never call from an async task.
    fn pick_app(&self, prompt: &str, apps: &[InstalledApp]) -> Result<Option<InstalledApp>> {
        if apps.is_empty() {
            return Ok(None);
        }
        if let Some(tx) = &self.line_picker {
            let (reply, answer) = oneshot::channel();
            tx.send(PickRequest {
                prompt: prompt.to_string(),
                apps: apps.to_vec(),
                reply,
            })
            .map_err(|_| Error::ActionExecutionFailure("app picker closed".to_string()))?;
            return Ok(answer.blocking_recv().ok().flatten());
        }

        let labels: Vec<String> = apps
            .iter()
            .map(|a| format!("{} ({})", a.name, a.package))
            .collect();
        let choice = Select::new()
            .with_prompt(prompt)
            .items(&labels)
            .default(0)
            .interact_opt()
            .map_err(|e| Error::ActionExecutionFailure(format!("app picker: {}", e)))?;
        Ok(choice.and_then(|i| apps.get(i).cloned()))
    }
}

fn scan_applications(dir: &Path, apps: &mut Vec<InstalledApp>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("desktop") {
            continue;
        }
        let Some(package) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Ok(contents) = std::fs::read_to_string(&path) {
            if let Some(name) = desktop_entry_name(&contents) {
                apps.push(InstalledApp {
                    name,
                    package: package.to_string(),
                });
            }
        }
    }
}

/// Display name of a launchable `.desktop` entry
pub fn desktop_entry_name(contents: &str) -> Option<String> {
    let mut in_entry = false;
    let mut name = None;
    let mut is_app = false;

    for line in contents.lines().map(str::trim) {
        if line.starts_with('[') {
            in_entry = line == "[Desktop Entry]";
            continue;
        }
        if !in_entry {
            continue;
        }
        match line.split_once('=') {
            Some(("Name", value)) if name.is_none() => name = Some(value.trim().to_string()),
            Some(("Type", value)) => is_app = value.trim() == "Application",
            Some(("NoDisplay", value)) | Some(("Hidden", value)) if value.trim() == "true" => {
                return None
            }
            _ => {}
        }
    }
    name.filter(|n| is_app && !n.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desktop_entry_name() {
        let entry = "[Desktop Entry]\nType=Application\nName=Firefox\nName[de]=Feuerfuchs\nExec=firefox %u\n\n[Desktop Action new-window]\nName=New Window\n";
        assert_eq!(desktop_entry_name(entry).as_deref(), Some("Firefox"));
    }

    #[test]
    fn test_hidden_entries_skipped() {
        let entry = "[Desktop Entry]\nType=Application\nName=Helper\nNoDisplay=true\n";
        assert_eq!(desktop_entry_name(entry), None);
        let link = "[Desktop Entry]\nType=Link\nName=Docs\n";
        assert_eq!(desktop_entry_name(link), None);
    }

    #[test]
    fn test_installed_apps_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("org.gnome.Calculator.desktop"),
            "[Desktop Entry]\nType=Application\nName=Calculator\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("alacritty.desktop"),
            "[Desktop Entry]\nType=Application\nName=Alacritty\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "Name=Nope").unwrap();

        let platform = DesktopPlatform::with_application_dirs(vec![dir.path().to_path_buf()]);
        let apps = platform.installed_apps().unwrap();
        assert_eq!(
            apps,
            vec![
                InstalledApp {
                    name: "Alacritty".into(),
                    package: "alacritty".into()
                },
                InstalledApp {
                    name: "Calculator".into(),
                    package: "org.gnome.Calculator".into()
                },
            ]
        );
    }

    fn apps() -> Vec<InstalledApp> {
        vec![
            InstalledApp {
                name: "Signal".into(),
                package: "org.signal.Signal".into(),
            },
            InstalledApp {
                name: "Firefox".into(),
                package: "firefox".into(),
            },
        ]
    }

    #[test]
    fn test_parse_choice() {
        let apps = apps();
        assert_eq!(parse_choice("2", &apps), Some(apps[1].clone()));
        assert_eq!(parse_choice("  signal ", &apps), Some(apps[0].clone()));
        assert_eq!(parse_choice("FIREFOX", &apps), Some(apps[1].clone()));
        assert_eq!(parse_choice("0", &apps), None);
        assert_eq!(parse_choice("3", &apps), None);
        assert_eq!(parse_choice("", &apps), None);
        assert_eq!(parse_choice("q", &apps), None);
    }

    #[test]
    fn test_line_picker_waits_for_typed_answer() {
        let (platform, mut requests) =
            DesktopPlatform::with_application_dirs(vec![]).with_line_picker();
        let picker = std::thread::spawn(move || platform.pick_app("Which app is 'chat'?", &apps()));

        let request = requests.blocking_recv().unwrap();
        assert_eq!(request.prompt, "Which app is 'chat'?");
        assert_eq!(request.apps.len(), 2);
        request.answer("1");

        let picked = picker.join().unwrap().unwrap();
        assert_eq!(picked.map(|a| a.package).as_deref(), Some("org.signal.Signal"));
    }

    #[test]
    fn test_line_picker_dismissed() {
        let (platform, mut requests) =
            DesktopPlatform::with_application_dirs(vec![]).with_line_picker();
        let picker = std::thread::spawn(move || platform.pick_app("Which?", &apps()));

        // Dropping the request without answering counts as no choice
        drop(requests.blocking_recv().unwrap());
        assert_eq!(picker.join().unwrap().unwrap(), None);

        let (platform, requests) =
            DesktopPlatform::with_application_dirs(vec![]).with_line_picker();
        drop(requests);
        assert!(platform.pick_app("Which?", &apps()).is_err());
    }

    #[test]
    fn test_unknown_vpn_action_rejected() {
        let platform = DesktopPlatform::with_application_dirs(vec![]);
        assert!(matches!(
            platform.send_action("work-vpn", "RESTART"),
            Err(Error::ActionExecutionFailure(_))
        ));
    }
}
