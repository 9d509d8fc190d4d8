//! Login step, login submission and step-result types
//!
//! These are the closed sums the whole consent machinery branches on: a bank
//! either asks for a form or sends the user through a redirect, a user posts
//! back a filled form or a redirect URL, and processing ends in exactly one of
//! four outcomes. New step kinds are a code change, not data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use utoipa::ToSchema;

use crate::models::consent_session::Model as ConsentSessionModel;

/// Field values posted for a form, keyed by component id.
pub type FilledForm = BTreeMap<String, String>;

/// One input field of a provider form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FormComponent {
    /// Stable field identifier the provider keys answers on
    pub id: String,
    /// Label shown to the user
    pub display_name: String,
    /// Whether the field may be left unanswered
    #[serde(default)]
    pub optional: bool,
}

/// A provider form: the ordered fields the user must fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Form {
    pub components: Vec<FormComponent>,
}

impl Form {
    /// Ids of the fields that must carry an answer.
    pub fn required_ids(&self) -> impl Iterator<Item = &str> {
        self.components
            .iter()
            .filter(|c| !c.optional)
            .map(|c| c.id.as_str())
    }

    fn has_component(&self, id: &str) -> bool {
        self.components.iter().any(|c| c.id == id)
    }
}

/// A form step handed to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FormStep {
    pub form: Form,
    /// Opaque instructions for encrypting sensitive answers client-side
    pub encryption_details: Option<JsonValue>,
    /// Opaque provider-side state, round-tripped verbatim
    pub provider_state: Option<String>,
    /// State token correlating the eventual submission to its session
    pub state_id: String,
}

/// A redirect step handed to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RedirectStep {
    /// Bank URL the user must visit to authenticate/consent
    pub redirect_url: String,
    /// Bank-side consent identifier, when the provider exposes one
    pub external_consent_id: Option<String>,
    /// Opaque provider-side state, round-tripped verbatim
    pub provider_state: Option<String>,
    /// State token correlating the eventual submission to its session
    pub state_id: String,
}

/// What the bank asks the user to do next. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoginStep {
    Form(FormStep),
    Redirect(RedirectStep),
}

impl LoginStep {
    pub fn state_id(&self) -> &str {
        match self {
            LoginStep::Form(step) => &step.state_id,
            LoginStep::Redirect(step) => &step.state_id,
        }
    }

    pub fn provider_state(&self) -> Option<&str> {
        match self {
            LoginStep::Form(step) => step.provider_state.as_deref(),
            LoginStep::Redirect(step) => step.provider_state.as_deref(),
        }
    }
}

/// A completed redirect posted back by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UrlLogin {
    /// Full redirect-back URL including the query the bank appended
    pub redirect_url: String,
}

/// A filled form posted back by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FormLogin {
    /// State token from the step the answers belong to
    pub state_id: String,
    pub filled_form: FilledForm,
}

/// What the user posts back. Exactly one of the two shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Login {
    Url(UrlLogin),
    Form(FormLogin),
}

/// Outcome of processing one posted login. `LoginFailed` is a functional
/// failure surfaced to the user; `NoActivity` is an internal no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepResult {
    NextStep {
        user_site_id: uuid::Uuid,
        step: LoginStep,
    },
    Activity {
        user_site_id: uuid::Uuid,
        activity_id: uuid::Uuid,
    },
    LoginFailed {
        user_site_id: uuid::Uuid,
    },
    NoActivity {
        user_site_id: uuid::Uuid,
    },
}

/// Problems with a posted form or a stored step payload.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("required field '{0}' has no answer")]
    MissingAnswer(String),
    #[error("field '{0}' has an empty answer")]
    EmptyAnswer(String),
    #[error("field '{0}' is not part of the form")]
    UnknownField(String),
    #[error("stored step payload is malformed: {0}")]
    MalformedStoredStep(#[from] serde_json::Error),
}

/// Generate a cryptographically secure random state token.
pub fn generate_state_id() -> String {
    use rand::Rng;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);

    base64_url::encode(&bytes)
}

/// Pull the state token out of a completed redirect URL.
pub fn extract_state_from_redirect(redirect_url: &str) -> Option<String> {
    let url = url::Url::parse(redirect_url).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
}

/// Check a posted form against the schema it answers: every required field
/// answered, no empty answers, no fields the form never asked for.
pub fn validate_filled_form(form: &Form, filled: &FilledForm) -> Result<(), StepError> {
    for id in form.required_ids() {
        match filled.get(id) {
            None => return Err(StepError::MissingAnswer(id.to_string())),
            Some(value) if value.trim().is_empty() => {
                return Err(StepError::EmptyAnswer(id.to_string()));
            }
            Some(_) => {}
        }
    }

    for id in filled.keys() {
        if !form.has_component(id) {
            return Err(StepError::UnknownField(id.clone()));
        }
    }

    Ok(())
}

/// Fill a form from remembered answers. Only returns a form when every
/// required field is covered; partial coverage never auto-completes.
pub fn autocomplete(form: &Form, persisted: &BTreeMap<String, String>) -> Option<FilledForm> {
    let mut filled = FilledForm::new();
    for component in &form.components {
        match persisted.get(&component.id) {
            Some(value) if !value.trim().is_empty() => {
                filled.insert(component.id.clone(), value.clone());
            }
            _ if component.optional => {}
            _ => return None,
        }
    }
    Some(filled)
}

/// Decode the pending step of a session, if it has one. The two step columns
/// are mutually exclusive; a session fresh from flow initiation over a
/// redirect may have neither.
pub fn pending_step(session: &ConsentSessionModel) -> Result<Option<LoginStep>, StepError> {
    if let Some(json) = &session.form_step {
        let step: FormStep = serde_json::from_value(json.clone())?;
        return Ok(Some(LoginStep::Form(step)));
    }
    if let Some(json) = &session.redirect_step {
        let step: RedirectStep = serde_json::from_value(json.clone())?;
        return Ok(Some(LoginStep::Redirect(step)));
    }
    Ok(None)
}

/// Split a step into its storage columns (form_step, redirect_step).
pub fn step_columns(step: &LoginStep) -> Result<(Option<JsonValue>, Option<JsonValue>), StepError> {
    match step {
        LoginStep::Form(form) => Ok((Some(serde_json::to_value(form)?), None)),
        LoginStep::Redirect(redirect) => Ok((None, Some(serde_json::to_value(redirect)?))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_form() -> Form {
        Form {
            components: vec![
                FormComponent {
                    id: "username".to_string(),
                    display_name: "Username".to_string(),
                    optional: false,
                },
                FormComponent {
                    id: "password".to_string(),
                    display_name: "Password".to_string(),
                    optional: false,
                },
                FormComponent {
                    id: "region".to_string(),
                    display_name: "Region".to_string(),
                    optional: true,
                },
            ],
        }
    }

    fn answers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn complete_form_validates() {
        let form = sample_form();
        let filled = answers(&[("username", "alice"), ("password", "hunter2")]);
        assert!(validate_filled_form(&form, &filled).is_ok());
    }

    #[test]
    fn missing_required_answer_rejected() {
        let form = sample_form();
        let filled = answers(&[("username", "alice")]);
        assert!(matches!(
            validate_filled_form(&form, &filled),
            Err(StepError::MissingAnswer(field)) if field == "password"
        ));
    }

    #[test]
    fn blank_answer_rejected() {
        let form = sample_form();
        let filled = answers(&[("username", "alice"), ("password", "   ")]);
        assert!(matches!(
            validate_filled_form(&form, &filled),
            Err(StepError::EmptyAnswer(field)) if field == "password"
        ));
    }

    #[test]
    fn unknown_field_rejected() {
        let form = sample_form();
        let filled = answers(&[
            ("username", "alice"),
            ("password", "hunter2"),
            ("otp", "123456"),
        ]);
        assert!(matches!(
            validate_filled_form(&form, &filled),
            Err(StepError::UnknownField(field)) if field == "otp"
        ));
    }

    #[test]
    fn autocomplete_needs_full_required_coverage() {
        let form = sample_form();

        let partial = answers(&[("username", "alice")]);
        assert!(autocomplete(&form, &partial).is_none());

        let full = answers(&[("username", "alice"), ("password", "hunter2")]);
        let filled = autocomplete(&form, &full).expect("covered form auto-completes");
        assert_eq!(filled.get("username").map(String::as_str), Some("alice"));
        assert!(!filled.contains_key("region"));
    }

    #[test]
    fn autocomplete_carries_optional_answers_when_present() {
        let form = sample_form();
        let persisted = answers(&[
            ("username", "alice"),
            ("password", "hunter2"),
            ("region", "north"),
        ]);
        let filled = autocomplete(&form, &persisted).expect("covered form auto-completes");
        assert_eq!(filled.get("region").map(String::as_str), Some("north"));
    }

    #[test]
    fn state_extraction_from_redirect() {
        let state = extract_state_from_redirect(
            "https://client.example.com/callback?code=abc&state=tok-123",
        );
        assert_eq!(state.as_deref(), Some("tok-123"));

        assert!(extract_state_from_redirect("https://client.example.com/callback?code=abc").is_none());
        assert!(extract_state_from_redirect("not a url").is_none());
    }

    #[test]
    fn state_ids_are_unique_and_url_safe() {
        let a = generate_state_id();
        let b = generate_state_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn step_columns_are_mutually_exclusive() {
        let form_step = LoginStep::Form(FormStep {
            form: sample_form(),
            encryption_details: None,
            provider_state: Some("ps".to_string()),
            state_id: generate_state_id(),
        });
        let (form_col, redirect_col) = step_columns(&form_step).expect("serializes");
        assert!(form_col.is_some());
        assert!(redirect_col.is_none());

        let redirect_step = LoginStep::Redirect(RedirectStep {
            redirect_url: "https://bank.example.com/auth".to_string(),
            external_consent_id: None,
            provider_state: None,
            state_id: generate_state_id(),
        });
        let (form_col, redirect_col) = step_columns(&redirect_step).expect("serializes");
        assert!(form_col.is_none());
        assert!(redirect_col.is_some());
    }

    #[test]
    fn login_serde_shape_is_tagged() {
        let login = Login::Form(FormLogin {
            state_id: "tok".to_string(),
            filled_form: answers(&[("username", "alice")]),
        });
        let json = serde_json::to_value(&login).expect("serializes");
        assert_eq!(json["type"], "FORM");

        let back: Login = serde_json::from_value(json).expect("deserializes");
        assert_eq!(back, login);
    }
}
