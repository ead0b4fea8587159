//! What to do with an NLU response.
//!
//! Every handler gets the response parameters and the service's default
//! reply, and returns what should be spoken. A failed side effect swaps the
//! reply for a fixed apology; it never stops the pipeline from speaking.

use crate::cortex::NluResponse;
use crate::custom_actions::CustomActionMap;
use crate::platform::{CallState, InstalledApp, Permission, Platform};
use crate::Result;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    OpenApp,
    WebSearch,
    PlayMedia,
    ControlVpn,
    MakeCall,
    CheckPhoneStatus,
    LearnAppIntent,
    EnableAccessibility,
    Chat,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::OpenApp,
        Action::WebSearch,
        Action::PlayMedia,
        Action::ControlVpn,
        Action::MakeCall,
        Action::CheckPhoneStatus,
        Action::LearnAppIntent,
        Action::EnableAccessibility,
        Action::Chat,
    ];

    /// Unknown names fall back to [`Action::Chat`]
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|a| a.name() == name.trim())
            .unwrap_or(Action::Chat)
    }

    pub fn name(self) -> &'static str {
        match self {
            Action::OpenApp => "open_app",
            Action::WebSearch => "web_search",
            Action::PlayMedia => "play_media",
            Action::ControlVpn => "control_vpn",
            Action::MakeCall => "make_call",
            Action::CheckPhoneStatus => "check_phone_status",
            Action::LearnAppIntent => "learn_app_intent",
            Action::EnableAccessibility => "enable_accessibility",
            Action::Chat => "chat",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Work to start once the reply has been spoken
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    PickApp { guess: String },
    OpenAccessibilitySettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub speech: String,
    pub follow_up: Option<FollowUp>,
}

impl Outcome {
    fn say(speech: impl Into<String>) -> Self {
        Self {
            speech: speech.into(),
            follow_up: None,
        }
    }
}

/// Collaborators the handlers may touch
#[derive(Clone)]
pub struct ActionContext {
    /// `None` when the host offers no integration; handlers then just speak
    pub platform: Option<Arc<dyn Platform>>,
    pub custom_actions: CustomActionMap,
    pub vpn_package: String,
}

pub fn execute(ctx: &ActionContext, response: &NluResponse) -> Outcome {
    let action = Action::from_name(&response.action);
    if action == Action::Chat && response.action != "chat" {
        tracing::debug!(action = %response.action, "unknown action, treating as chat");
    }
    let spoken = response.spoken_response.as_str();

    match action {
        Action::OpenApp => open_app(ctx, response, spoken),
        Action::WebSearch => web_search(ctx, response, spoken),
        Action::PlayMedia => play_media(ctx, response, spoken),
        Action::ControlVpn => control_vpn(ctx, response, spoken),
        Action::MakeCall => make_call(ctx, response, spoken),
        Action::CheckPhoneStatus => check_phone_status(ctx, spoken),
        Action::LearnAppIntent => learn_app_intent(ctx, response, spoken),
        Action::EnableAccessibility => enable_accessibility(ctx, spoken),
        Action::Chat => Outcome::say(spoken),
    }
}

fn quote(query: &str) -> String {
    urlencoding::encode(query).into_owned()
}

/// Substitute `fallback` if the side effect failed
fn or_fallback(result: Result<()>, spoken: &str, fallback: &str) -> Outcome {
    match result {
        Ok(()) => Outcome::say(spoken),
        Err(e) => {
            tracing::warn!(error = %e, "action failed");
            Outcome::say(fallback)
        }
    }
}

fn open_app(ctx: &ActionContext, response: &NluResponse, spoken: &str) -> Outcome {
    let Some(platform) = &ctx.platform else {
        return Outcome::say(spoken);
    };
    let package = response.param("package_name").or_else(|| {
        response.param("app_name").and_then(|name| ctx.custom_actions.get(&name))
    });
    match package {
        Some(package) => or_fallback(
            platform.launch_app(&package),
            spoken,
            "I couldn't open that app.",
        ),
        None => Outcome::say(spoken),
    }
}

fn web_search(ctx: &ActionContext, response: &NluResponse, spoken: &str) -> Outcome {
    let (Some(platform), Some(query)) = (&ctx.platform, response.param("query")) else {
        return Outcome::say(spoken);
    };
    let url = format!("https://www.google.com/search?q={}", quote(&query));
    or_fallback(platform.open_url(&url), spoken, "I couldn't start a web search.")
}

fn play_media(ctx: &ActionContext, response: &NluResponse, spoken: &str) -> Outcome {
    let (Some(platform), Some(query)) = (&ctx.platform, response.param("query")) else {
        return Outcome::say(spoken);
    };
    let app_url = format!("vnd.youtube:{}", quote(&query));
    let url = if platform.can_open(&app_url) {
        app_url
    } else {
        format!(
            "https://www.youtube.com/results?search_query={}",
            quote(&query)
        )
    };
    or_fallback(
        platform.open_url(&url),
        spoken,
        &format!("I had trouble trying to play '{}'.", query),
    )
}

fn control_vpn(ctx: &ActionContext, response: &NluResponse, spoken: &str) -> Outcome {
    let (Some(platform), Some(state)) = (&ctx.platform, response.param("state")) else {
        return Outcome::say(spoken);
    };
    let action = if state == "on" { "CONNECT" } else { "DISCONNECT" };
    or_fallback(
        platform.send_action(&ctx.vpn_package, action),
        spoken,
        "I couldn't interact with the VPN app.",
    )
}

fn make_call(ctx: &ActionContext, response: &NluResponse, spoken: &str) -> Outcome {
    match (&ctx.platform, response.param("number")) {
        (Some(platform), Some(number)) => {
            let result = if platform.has_permission(Permission::CallPhone) {
                platform.start_call(&number)
            } else {
                Err(crate::Error::ActionExecutionFailure(
                    "CALL_PHONE denied".to_string(),
                ))
            };
            or_fallback(
                result,
                spoken,
                "I couldn't make the call. Do I have permission?",
            )
        }
        _ if response.param("contact_name").is_some() => {
            Outcome::say("I can't access contacts yet, please provide a number.")
        }
        _ => Outcome::say(spoken),
    }
}

fn check_phone_status(ctx: &ActionContext, spoken: &str) -> Outcome {
    let Some(platform) = &ctx.platform else {
        return Outcome::say(spoken);
    };
    let state = if platform.has_permission(Permission::ReadPhoneState) {
        platform.call_state()
    } else {
        Err(crate::Error::ActionExecutionFailure(
            "READ_PHONE_STATE denied".to_string(),
        ))
    };
    match state {
        Ok(CallState::Ringing) => Outcome::say("Your phone is currently ringing."),
        Ok(CallState::OffHook) => Outcome::say("You are currently in a call."),
        Ok(CallState::Idle) => Outcome::say("Your phone is not in a call."),
        Err(e) => {
            tracing::warn!(error = %e, "phone status unavailable");
            Outcome::say("I couldn't check the phone status. Do I have permission?")
        }
    }
}

fn learn_app_intent(ctx: &ActionContext, response: &NluResponse, spoken: &str) -> Outcome {
    let guess = response.param("app_name").unwrap_or_else(|| "the app".to_string());
    Outcome {
        speech: spoken.to_string(),
        follow_up: ctx.platform.as_ref().map(|_| FollowUp::PickApp { guess }),
    }
}

fn enable_accessibility(ctx: &ActionContext, spoken: &str) -> Outcome {
    Outcome {
        speech: spoken.to_string(),
        follow_up: ctx
            .platform
            .as_ref()
            .map(|_| FollowUp::OpenAccessibilitySettings),
    }
}

/// Ask the user which installed app `guess` refers to. Blocks on the user.
pub fn pick_app(platform: &dyn Platform, guess: &str) -> Result<Option<InstalledApp>> {
    let apps = platform.installed_apps()?;
    if apps.is_empty() {
        tracing::warn!("no installed apps to choose from");
        return Ok(None);
    }
    platform.pick_app(&format!("Which app is '{}'?", guess), &apps)
}

/// Message telling the NLU service about a learned app
pub fn learning_message(app: &InstalledApp) -> String {
    format!(
        "Learning complete: The app '{}' has package name '{}'. Remember this.",
        app.name, app.package
    )
}
