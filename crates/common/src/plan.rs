//! Declarative YAML test plans
//!
//! A plan names the application under test, the personas that log into it,
//! and the cases to run. Each case is an ordered script of browser steps
//! followed by an expected-outcome predicate.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::{Error, Result};

/// A complete test plan parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    /// Plan name, recorded on every run
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Root URL of the application under test; step URLs are relative to it
    pub base_url: String,

    /// Login form used by `login` steps
    #[serde(default)]
    pub login: Option<LoginForm>,

    /// Credentials by persona name
    pub personas: BTreeMap<String, Persona>,

    /// Cases to run
    pub cases: Vec<TestCase>,
}

/// Credentials and browser choice for one simulated user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub username: String,
    pub password: String,
    #[serde(default = "default_browser")]
    pub browser: String,
}

fn default_browser() -> String {
    "firefox".to_string()
}

impl Persona {
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(Error::invalid_plan(format!("persona '{}' has an empty username", name)));
        }
        if self.username.chars().any(char::is_whitespace) {
            return Err(Error::invalid_plan(format!(
                "persona '{}' username contains whitespace",
                name
            )));
        }
        if self.password.is_empty() {
            return Err(Error::invalid_plan(format!("persona '{}' has an empty password", name)));
        }
        if self.browser.trim().is_empty() {
            return Err(Error::invalid_plan(format!("persona '{}' has an empty browser", name)));
        }
        Ok(())
    }

    /// Expand `${username}` and `${password}` placeholders.
    pub fn substitute(&self, value: &str) -> String {
        value
            .replace("${username}", &self.username)
            .replace("${password}", &self.password)
    }
}

/// Selectors of the application's login form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginForm {
    #[serde(default = "default_login_url")]
    pub url: String,
    pub username_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    /// Element that must be present after a successful login
    #[serde(default)]
    pub success_selector: Option<String>,
}

fn default_login_url() -> String {
    "/login".to_string()
}

/// A single scripted end-to-end scenario bound to a persona
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Unique id within the plan
    pub id: String,

    #[serde(default)]
    pub description: String,

    /// Key into the plan's persona table
    pub persona: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Steps to execute in order
    pub steps: Vec<Step>,

    /// Checks evaluated after the last step
    #[serde(default)]
    pub expect: Vec<Check>,
}

/// A single step in a case script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Log in through the plan's login form with the case persona
    Login,

    /// Navigate to a URL (relative to the base URL)
    Navigate { url: String },

    /// Click an element
    Click { selector: String },

    /// Type into an input field
    Fill {
        selector: String,
        value: String,
        #[serde(default)]
        clear_first: bool,
    },

    /// Submit the form containing an element
    Submit { selector: String },

    /// Wait for an element to be present
    Wait {
        selector: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
    },

    /// Check rendered state mid-script
    Assert(Check),

    /// Capture a screenshot
    Screenshot { name: String },

    /// Pause for a fixed time (use sparingly)
    Sleep { ms: u64 },

    /// Append a line to the attempt protocol
    Log { message: String },
}

fn default_wait_timeout() -> u64 {
    5000
}

impl Step {
    /// Short label used in protocol lines and timings
    pub fn label(&self) -> String {
        match self {
            Step::Login => "login".to_string(),
            Step::Navigate { url } => format!("navigate:{}", url),
            Step::Click { selector } => format!("click:{}", selector),
            Step::Fill { selector, .. } => format!("fill:{}", selector),
            Step::Submit { selector } => format!("submit:{}", selector),
            Step::Wait { selector, .. } => format!("wait:{}", selector),
            Step::Assert(check) => format!("assert:{}", check.describe()),
            Step::Screenshot { name } => format!("screenshot:{}", name),
            Step::Sleep { ms } => format!("sleep:{}ms", ms),
            Step::Log { message } => format!("log:{}", message.chars().take(30).collect::<String>()),
        }
    }
}

/// A predicate over rendered page state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Check {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub visible: Option<bool>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub text_contains: Option<String>,
    #[serde(default)]
    pub url_contains: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl Check {
    fn validate(&self, case_id: &str) -> Result<()> {
        let element_predicate =
            self.visible.is_some() || self.text.is_some() || self.text_contains.is_some();
        if element_predicate && self.selector.is_none() {
            return Err(Error::invalid_plan(format!(
                "case '{}': element check without a selector",
                case_id
            )));
        }
        if self.selector.is_none() && self.url_contains.is_none() && self.title.is_none() {
            return Err(Error::invalid_plan(format!("case '{}': empty check", case_id)));
        }
        Ok(())
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(sel) = &self.selector {
            parts.push(sel.clone());
        }
        if let Some(url) = &self.url_contains {
            parts.push(format!("url~{}", url));
        }
        if let Some(title) = &self.title {
            parts.push(format!("title={}", title));
        }
        parts.join(",")
    }
}

impl TestPlan {
    /// Parse a plan from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    /// Parse a plan from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Check that the plan can be run. Nothing is started for an invalid plan.
    pub fn validate(&self) -> Result<()> {
        if self.cases.is_empty() {
            return Err(Error::invalid_plan("plan contains no test cases"));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(Error::invalid_plan(format!(
                "base_url '{}' is not an http(s) URL",
                self.base_url
            )));
        }

        for (name, persona) in &self.personas {
            persona.validate(name)?;
        }

        let mut seen = HashSet::new();
        for case in &self.cases {
            if case.id.trim().is_empty() {
                return Err(Error::invalid_plan("test case with an empty id"));
            }
            if !seen.insert(case.id.as_str()) {
                return Err(Error::invalid_plan(format!("duplicate test case id '{}'", case.id)));
            }
            if !self.personas.contains_key(&case.persona) {
                return Err(Error::invalid_plan(format!(
                    "case '{}' references unknown persona '{}'",
                    case.id, case.persona
                )));
            }
            if case.steps.is_empty() {
                return Err(Error::invalid_plan(format!("case '{}' has no steps", case.id)));
            }
            for step in &case.steps {
                match step {
                    Step::Login if self.login.is_none() => {
                        return Err(Error::invalid_plan(format!(
                            "case '{}' logs in but the plan has no login form",
                            case.id
                        )));
                    }
                    Step::Assert(check) => check.validate(&case.id)?,
                    _ => {}
                }
            }
            for check in &case.expect {
                check.validate(&case.id)?;
            }
        }

        Ok(())
    }

    pub fn persona(&self, name: &str) -> Option<&Persona> {
        self.personas.get(name)
    }

    /// Keep only the cases carrying `tag`
    pub fn retain_tagged(&mut self, tag: &str) {
        self.cases.retain(|c| c.tags.iter().any(|t| t == tag));
    }
}
