//! Operation requests and results

use codespace_common::{
    CodespaceError, CodespaceResult, ComponentStatus, LifecycleState, ResourceKind, EXIT_FAILURE,
    EXIT_SUCCESS,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Status,
    Start,
    Stop,
    Restart,
    Cleanup,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Cleanup => "cleanup",
        }
    }

    /// Everything except `status` changes the environment
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Status)
    }

    /// Confirmation question asked before a mutating action
    pub fn confirmation_prompt(&self) -> Option<String> {
        let verb = match self {
            Self::Status => return None,
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Cleanup => "clean up",
        };
        let mut prompt = format!("Are you sure you want to {} the infrastructure?", verb);
        if matches!(self, Self::Cleanup) {
            prompt.push_str(" This cannot be undone.");
        }
        Some(prompt)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = CodespaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "status" => Ok(Self::Status),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "cleanup" => Ok(Self::Cleanup),
            _ => Err(CodespaceError::InvalidAction(s.to_string())),
        }
    }
}

/// What a `--service` value points at
///
/// `docker` targets the whole container manager, `docker:mysql` one named
/// service managed by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceTarget {
    Class(ResourceKind),
    Named { kind: ResourceKind, name: String },
}

impl ServiceTarget {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Class(kind) | Self::Named { kind, .. } => *kind,
        }
    }
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Class(kind) => write!(f, "{}", kind),
            Self::Named { kind, name } => write!(f, "{}:{}", kind, name),
        }
    }
}

impl FromStr for ServiceTarget {
    type Err = CodespaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CodespaceError::InvalidService(s.to_string());
        let value = s.trim();

        match value.split_once(':') {
            Some((class, name)) => {
                let kind = class.parse::<ResourceKind>().map_err(|_| invalid())?;
                let name = name.trim();
                if name.is_empty() || name.contains(':') {
                    return Err(invalid());
                }
                Ok(Self::Named {
                    kind,
                    name: name.to_string(),
                })
            }
            None => value
                .parse::<ResourceKind>()
                .map(Self::Class)
                .map_err(|_| invalid()),
        }
    }
}

/// A validated orchestrator invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub action: Action,
    pub service: Option<ServiceTarget>,
    pub force: bool,
    pub environment: Option<String>,
}

impl OperationRequest {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            service: None,
            force: false,
            environment: None,
        }
    }

    /// Validate raw CLI input; nothing is executed
    pub fn parse(
        action: &str,
        service: Option<&str>,
        force: bool,
        environment: Option<&str>,
    ) -> CodespaceResult<Self> {
        let action = action.parse::<Action>()?;
        let service = service
            .filter(|s| !s.trim().is_empty())
            .map(str::parse::<ServiceTarget>)
            .transpose()?;

        if action == Action::Cleanup {
            if let Some(target) = &service {
                return Err(CodespaceError::InvalidService(format!(
                    "{} (cleanup always covers the whole environment)",
                    target
                )));
            }
        }

        Ok(Self {
            action,
            service,
            force,
            environment: environment.map(str::to_string),
        })
    }

    pub fn with_service(mut self, target: ServiceTarget) -> Self {
        self.service = Some(target);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn in_environment(mut self, name: &str) -> Self {
        self.environment = Some(name.to_string());
        self
    }
}

/// Outcome of one orchestrator operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub action: Option<Action>,
    pub environment: String,
    pub success: bool,
    /// The user answered no; nothing ran
    pub declined: bool,
    pub messages: Vec<String>,
    /// Component statuses (status action only)
    pub report: Vec<ComponentStatus>,
    pub lifecycle_state: LifecycleState,
}

impl OperationResult {
    pub fn ok(action: Action, environment: &str, state: LifecycleState) -> Self {
        Self {
            action: Some(action),
            environment: environment.to_string(),
            success: true,
            declined: false,
            messages: Vec::new(),
            report: Vec::new(),
            lifecycle_state: state,
        }
    }

    pub fn declined(action: Action, environment: &str, state: LifecycleState) -> Self {
        let mut result = Self::ok(action, environment, state);
        result.declined = true;
        result.messages.push(format!("{} cancelled", capitalize(action.as_str())));
        result
    }

    /// Rejected before anything ran
    pub fn rejected(error: &CodespaceError, environment: &str, state: LifecycleState) -> Self {
        Self {
            action: None,
            environment: environment.to_string(),
            success: false,
            declined: false,
            messages: vec![error.to_string()],
            report: Vec::new(),
            lifecycle_state: state,
        }
    }

    pub fn fail(&mut self, error: impl fmt::Display) {
        self.success = false;
        self.messages.push(format!("Error: {}", error));
    }

    pub fn exit_code(&self) -> i32 {
        if self.success {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }

    pub fn output(&self) -> String {
        self.messages.join("\n")
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parse() {
        assert_eq!("start".parse::<Action>().unwrap(), Action::Start);
        assert_eq!(" Cleanup ".parse::<Action>().unwrap(), Action::Cleanup);
        let err = "explode".parse::<Action>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid action: explode");
    }

    #[test]
    fn test_prompts() {
        assert_eq!(Action::Status.confirmation_prompt(), None);
        assert_eq!(
            Action::Start.confirmation_prompt().unwrap(),
            "Are you sure you want to start the infrastructure?"
        );
        assert!(Action::Cleanup
            .confirmation_prompt()
            .unwrap()
            .ends_with("This cannot be undone."));
    }

    #[test]
    fn test_service_target_parse() {
        assert_eq!(
            "docker".parse::<ServiceTarget>().unwrap(),
            ServiceTarget::Class(ResourceKind::Docker)
        );
        assert_eq!(
            "docker:mysql".parse::<ServiceTarget>().unwrap(),
            ServiceTarget::Named {
                kind: ResourceKind::Docker,
                name: "mysql".to_string()
            }
        );
        assert_eq!(
            "docker:mysql".parse::<ServiceTarget>().unwrap().to_string(),
            "docker:mysql"
        );

        for bad in ["kubernetes", "docker:", "vm:web", "docker:a:b"] {
            let err = bad.parse::<ServiceTarget>().unwrap_err();
            assert_eq!(err.to_string(), format!("Invalid service: {}", bad));
        }
    }

    #[test]
    fn test_cleanup_rejects_service() {
        let err = OperationRequest::parse("cleanup", Some("docker"), true, None).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_empty_service_means_all() {
        let request = OperationRequest::parse("stop", Some(""), false, Some("dev")).unwrap();
        assert_eq!(request.service, None);
        assert_eq!(request.environment.as_deref(), Some("dev"));
    }

    #[test]
    fn test_declined_result_succeeds() {
        let result = OperationResult::declined(Action::Stop, "default", LifecycleState::Running);
        assert!(result.success);
        assert!(result.declined);
        assert_eq!(result.exit_code(), EXIT_SUCCESS);
        assert_eq!(result.output(), "Stop cancelled");
    }
}
