//! Auth prompt tracker (spec.md §4.5 "Auth prompt tracker"): pending
//! prompts keyed by UUID v4, a per-socket cap, and per-prompt timeouts.
//! Response validation enforces ownership, expiry, declared-button
//! membership, and rejects HTML-like content in free-text inputs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::GatewayError;

pub const DEFAULT_PER_SOCKET_CAP: usize = 8;
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_INPUT_FIELD_LEN: usize = 4096;

#[derive(Debug, Clone)]
pub struct PendingPrompt {
    pub id: String,
    pub buttons: Vec<String>,
    pub input_keys: Vec<String>,
    pub created_at: Instant,
    pub timeout: Duration,
}

impl PendingPrompt {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.timeout
    }
}

/// One client socket's set of pending prompts.
#[derive(Debug, Default)]
pub struct PromptTracker {
    pending: HashMap<String, PendingPrompt>,
    cap: usize,
}

#[derive(Debug, Clone)]
pub struct PromptResponseInput {
    pub id: String,
    pub action: String,
    pub inputs: HashMap<String, String>,
}

impl PromptTracker {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            cap: DEFAULT_PER_SOCKET_CAP,
        }
    }

    /// Registers a new prompt, returning its id. Fails closed (a
    /// `PolicyError`) once the per-socket cap is reached rather than
    /// silently evicting an older prompt.
    pub fn register(
        &mut self,
        buttons: Vec<String>,
        input_keys: Vec<String>,
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        self.evict_expired();
        if self.pending.len() >= self.cap {
            return Err(GatewayError::policy("too many pending prompts for this socket"));
        }
        let id = Uuid::new_v4().to_string();
        self.pending.insert(
            id.clone(),
            PendingPrompt {
                id: id.clone(),
                buttons,
                input_keys,
                created_at: Instant::now(),
                timeout,
            },
        );
        Ok(id)
    }

    fn evict_expired(&mut self) {
        self.pending.retain(|_, p| !p.is_expired());
    }

    /// The declared input field names for a still-pending prompt, without
    /// consuming it. Callers use this to turn a positional response (the
    /// wire payload carries input values, not a keyed map) into the keyed
    /// `inputs` map [`Self::resolve`] validates against.
    pub fn input_keys_for(&self, id: &str) -> Option<Vec<String>> {
        self.pending.get(id).map(|p| p.input_keys.clone())
    }

    /// Validates and consumes a response. On success the prompt is
    /// removed regardless of outcome (a prompt answers exactly once).
    pub fn resolve(&mut self, response: &PromptResponseInput) -> Result<(), GatewayError> {
        let Some(prompt) = self.pending.remove(&response.id) else {
            return Err(GatewayError::validation("unknown or already-resolved prompt id"));
        };

        if prompt.is_expired() {
            return Err(GatewayError::Timeout(prompt.timeout));
        }

        let allowed_actions: Vec<&str> = prompt
            .buttons
            .iter()
            .map(String::as_str)
            .chain(["dismissed", "timeout"])
            .collect();
        if !allowed_actions.contains(&response.action.as_str()) {
            return Err(GatewayError::validation(format!(
                "action {:?} not among declared buttons",
                response.action
            )));
        }

        if response.action == "dismissed" || response.action == "timeout" {
            return Ok(());
        }

        for key in &prompt.input_keys {
            let Some(value) = response.inputs.get(key) else {
                return Err(GatewayError::validation(format!("missing required input {key:?}")));
            };
            if value.is_empty() {
                return Err(GatewayError::validation(format!("input {key:?} must not be empty")));
            }
            if value.len() > MAX_INPUT_FIELD_LEN {
                return Err(GatewayError::validation(format!("input {key:?} exceeds length cap")));
            }
            if contains_html_like(value) {
                return Err(GatewayError::validation(format!("input {key:?} contains HTML-like content")));
            }
        }

        for key in response.inputs.keys() {
            if !prompt.input_keys.contains(key) {
                return Err(GatewayError::validation(format!("undeclared input key {key:?}")));
            }
        }

        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn contains_html_like(value: &str) -> bool {
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '<' {
            if let Some(&next) = chars.peek() {
                if next.is_ascii_alphabetic() || next == '/' || next == '!' {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_resolve_happy_path() {
        let mut tracker = PromptTracker::new();
        let id = tracker
            .register(vec!["ok".into(), "cancel".into()], vec!["password".into()], DEFAULT_PROMPT_TIMEOUT)
            .unwrap();

        let mut inputs = HashMap::new();
        inputs.insert("password".to_string(), "hunter2".to_string());
        let response = PromptResponseInput { id, action: "ok".into(), inputs };
        assert!(tracker.resolve(&response).is_ok());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn unknown_id_is_rejected() {
        let mut tracker = PromptTracker::new();
        let response = PromptResponseInput {
            id: "not-a-real-id".into(),
            action: "ok".into(),
            inputs: HashMap::new(),
        };
        assert!(tracker.resolve(&response).is_err());
    }

    #[test]
    fn action_outside_declared_buttons_is_rejected() {
        let mut tracker = PromptTracker::new();
        let id = tracker.register(vec!["ok".into()], vec![], DEFAULT_PROMPT_TIMEOUT).unwrap();
        let response = PromptResponseInput { id, action: "nope".into(), inputs: HashMap::new() };
        assert!(tracker.resolve(&response).is_err());
    }

    #[test]
    fn dismissed_and_timeout_are_always_allowed() {
        let mut tracker = PromptTracker::new();
        let id = tracker.register(vec!["ok".into()], vec!["password".into()], DEFAULT_PROMPT_TIMEOUT).unwrap();
        let response = PromptResponseInput { id, action: "dismissed".into(), inputs: HashMap::new() };
        assert!(tracker.resolve(&response).is_ok());
    }

    #[test]
    fn expired_prompt_is_rejected() {
        let mut tracker = PromptTracker::new();
        let id = tracker.register(vec!["ok".into()], vec![], Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let response = PromptResponseInput { id, action: "ok".into(), inputs: HashMap::new() };
        assert!(tracker.resolve(&response).is_err());
    }

    #[test]
    fn html_like_content_is_rejected() {
        let mut tracker = PromptTracker::new();
        let id = tracker.register(vec!["ok".into()], vec!["note".into()], DEFAULT_PROMPT_TIMEOUT).unwrap();
        let mut inputs = HashMap::new();
        inputs.insert("note".to_string(), "<script>alert(1)</script>".to_string());
        let response = PromptResponseInput { id, action: "ok".into(), inputs };
        assert!(tracker.resolve(&response).is_err());
    }

    #[test]
    fn undeclared_input_key_is_rejected() {
        let mut tracker = PromptTracker::new();
        let id = tracker.register(vec!["ok".into()], vec!["password".into()], DEFAULT_PROMPT_TIMEOUT).unwrap();
        let mut inputs = HashMap::new();
        inputs.insert("password".to_string(), "hunter2".to_string());
        inputs.insert("extra".to_string(), "sneaky".to_string());
        let response = PromptResponseInput { id, action: "ok".into(), inputs };
        assert!(tracker.resolve(&response).is_err());
    }

    #[test]
    fn input_keys_for_returns_declared_keys_without_consuming() {
        let mut tracker = PromptTracker::new();
        let id = tracker
            .register(vec!["ok".into(), "cancel".into()], vec!["username".into(), "password".into()], DEFAULT_PROMPT_TIMEOUT)
            .unwrap();
        assert_eq!(tracker.input_keys_for(&id), Some(vec!["username".to_string(), "password".to_string()]));
        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.input_keys_for("unknown-id"), None);
    }

    #[test]
    fn cap_is_enforced() {
        let mut tracker = PromptTracker::new();
        for _ in 0..DEFAULT_PER_SOCKET_CAP {
            tracker.register(vec!["ok".into()], vec![], DEFAULT_PROMPT_TIMEOUT).unwrap();
        }
        assert!(tracker.register(vec!["ok".into()], vec![], DEFAULT_PROMPT_TIMEOUT).is_err());
    }
}
