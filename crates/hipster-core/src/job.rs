use crate::error::WorkerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Job argument naming the project a change belongs to.
pub const PROJECT_KEY: &str = "ZUUL_PROJECT";

/// A unit of work delivered by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Queue-wide unique id, also the token a targeted stop carries.
    pub unique: String,
    /// Function the job was submitted to, e.g. `build:real-db-upgrade`.
    pub function: String,
    pub arguments: Vec<u8>,
}

impl Job {
    pub fn new(unique: impl Into<String>, function: impl Into<String>, arguments: Vec<u8>) -> Self {
        Self {
            unique: unique.into(),
            function: function.into(),
            arguments,
        }
    }

    /// Job whose payload is the JSON encoding of `args`.
    pub fn with_json_args(
        unique: impl Into<String>,
        function: impl Into<String>,
        args: &BTreeMap<String, String>,
    ) -> Self {
        let payload = serde_json::to_vec(args).unwrap_or_default();
        Self::new(unique, function, payload)
    }

    /// Payload as text, for control jobs whose argument is a bare token.
    pub fn arguments_str(&self) -> String {
        String::from_utf8_lossy(&self.arguments).trim().to_string()
    }
}

/// Encode a queue-supplied value as a single path component.
///
/// Bytes outside `[A-Za-z0-9._-]` become `%XX`, so the encoding never
/// yields a separator and distinct inputs never share a component. The
/// empty string and the dot names, which would otherwise resolve to an
/// existing directory, are escaped as well.
pub fn path_component(raw: &str) -> String {
    match raw {
        "" => return "%".to_string(),
        "." => return "%2E".to_string(),
        ".." => return "%2E%2E".to_string(),
        _ => {}
    }
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

/// Decoded job payload: a flat string map carrying at least the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobArguments(BTreeMap<String, String>);

impl JobArguments {
    pub fn from_payload(payload: &[u8]) -> Result<Self, WorkerError> {
        let map: BTreeMap<String, String> = serde_json::from_slice(payload).map_err(|e| {
            WorkerError::Payload(format!("job arguments are not a JSON string map: {}", e))
        })?;
        if !map.contains_key(PROJECT_KEY) {
            return Err(WorkerError::Payload(format!("missing {}", PROJECT_KEY)));
        }
        Ok(Self(map))
    }

    pub fn project(&self) -> &str {
        self.0.get(PROJECT_KEY).map(String::as_str).unwrap_or_default()
    }

    /// Last path segment of the project, e.g. `nova` for `openstack/nova`.
    pub fn project_basename(&self) -> &str {
        self.project().rsplit('/').next().unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

/// Result string carried in work data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResultStatus {
    Success,
    Untested,
    Cancelled,
    /// The job left shared state (databases, checkouts) unusable for the
    /// next job. The manager shuts down on seeing it.
    Dirty,
    Failed(String),
}

impl ResultStatus {
    pub const SUCCESS: &'static str = "SUCCESS";
    pub const UNTESTED: &'static str = "UNTESTED";
    pub const CANCELLED: &'static str = "Failed: Job cancelled";
    pub const DIRTY: &'static str = "DIRTY";

    pub fn as_str(&self) -> &str {
        match self {
            ResultStatus::Success => Self::SUCCESS,
            ResultStatus::Untested => Self::UNTESTED,
            ResultStatus::Cancelled => Self::CANCELLED,
            ResultStatus::Dirty => Self::DIRTY,
            ResultStatus::Failed(reason) => reason,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ResultStatus::Success
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ResultStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            Self::SUCCESS => ResultStatus::Success,
            Self::UNTESTED => ResultStatus::Untested,
            Self::CANCELLED => ResultStatus::Cancelled,
            Self::DIRTY => ResultStatus::Dirty,
            _ => ResultStatus::Failed(s),
        }
    }
}

impl From<ResultStatus> for String {
    fn from(r: ResultStatus) -> Self {
        r.as_str().to_string()
    }
}

/// Progress/result snapshot sent to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkData {
    pub name: String,
    pub number: String,
    pub manager: String,
    pub url: Option<String>,
    pub result: Option<ResultStatus>,
    /// Why a job whose result is `DIRTY` failed, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WorkData {
    pub fn new(name: String, number: String, manager: String) -> Self {
        Self {
            name,
            number,
            manager,
            url: None,
            result: None,
            reason: None,
        }
    }

    /// Record the terminal result. Returns false if one was already set,
    /// in which case the existing result is kept.
    pub fn set_result(&mut self, result: ResultStatus) -> bool {
        if self.result.is_some() {
            return false;
        }
        self.result = Some(result);
        true
    }

    pub fn is_dirty(&self) -> bool {
        self.result == Some(ResultStatus::Dirty)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded(WorkData),
    Failed,
    /// Stopped at a step boundary. Reported on the `failed` channel.
    Cancelled,
    Excepted(String),
}

/// The three channels a terminal outcome is reported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeChannel {
    Succeeded,
    Failed,
    Excepted,
}

impl TaskOutcome {
    pub fn channel(&self) -> OutcomeChannel {
        match self {
            TaskOutcome::Succeeded(_) => OutcomeChannel::Succeeded,
            TaskOutcome::Failed | TaskOutcome::Cancelled => OutcomeChannel::Failed,
            TaskOutcome::Excepted(_) => OutcomeChannel::Excepted,
        }
    }
}

impl fmt::Display for OutcomeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeChannel::Succeeded => write!(f, "succeeded"),
            OutcomeChannel::Failed => write!(f, "failed"),
            OutcomeChannel::Excepted => write!(f, "excepted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_require_project() {
        let err = JobArguments::from_payload(br#"{"ZUUL_CHANGE": "1234"}"#).unwrap_err();
        assert!(matches!(err, WorkerError::Payload(_)));

        let err = JobArguments::from_payload(b"not json").unwrap_err();
        assert!(matches!(err, WorkerError::Payload(_)));

        let args = JobArguments::from_payload(br#"{"ZUUL_PROJECT": "openstack/nova"}"#).unwrap();
        assert_eq!(args.project(), "openstack/nova");
        assert_eq!(args.project_basename(), "nova");
    }

    #[test]
    fn non_string_values_are_a_payload_error() {
        let err = JobArguments::from_payload(br#"{"ZUUL_PROJECT": 5}"#).unwrap_err();
        assert!(matches!(err, WorkerError::Payload(_)));
    }

    #[test]
    fn result_status_round_trips_through_strings() {
        assert_eq!(ResultStatus::from("SUCCESS".to_string()), ResultStatus::Success);
        assert_eq!(ResultStatus::from("DIRTY".to_string()), ResultStatus::Dirty);
        assert_eq!(
            ResultStatus::from("Failed: boom".to_string()),
            ResultStatus::Failed("Failed: boom".to_string())
        );
        assert_eq!(ResultStatus::Cancelled.to_string(), "Failed: Job cancelled");
    }

    #[test]
    fn work_data_json_shape() {
        let mut wd = WorkData::new("job".into(), "abc".into(), "mgr".into());
        assert_eq!(
            wd.to_json(),
            r#"{"name":"job","number":"abc","manager":"mgr","url":null,"result":null}"#
        );
        assert!(wd.set_result(ResultStatus::Success));
        assert!(!wd.set_result(ResultStatus::Failed("late".into())));
        wd.url = Some("http://x/index.html".into());
        let v: serde_json::Value = serde_json::from_str(&wd.to_json()).unwrap();
        assert_eq!(v["result"], "SUCCESS");
        assert_eq!(v["url"], "http://x/index.html");
        assert!(v.get("reason").is_none());
    }

    #[test]
    fn path_components_stay_distinct_and_inside_their_parent() {
        assert_eq!(path_component("job-1_a.b"), "job-1_a.b");
        assert_ne!(path_component("a/b"), path_component("a_b"));
        assert_ne!(path_component("a:b"), path_component("a%3Ab"));
        assert_eq!(path_component("a/b"), "a%2Fb");
        assert_eq!(path_component("/abs"), "%2Fabs");
        assert_eq!(path_component(".."), "%2E%2E");
        assert_eq!(path_component(""), "%");
        for raw in ["..", ".", "", "../x", "/etc", "a\\b"] {
            let component = path_component(raw);
            let path = std::path::Path::new("root").join(&component);
            assert_eq!(path.parent(), Some(std::path::Path::new("root")), "{:?}", raw);
            assert!(matches!(
                path.components().last(),
                Some(std::path::Component::Normal(_))
            ));
        }
    }

    #[test]
    fn cancelled_reports_on_failed_channel() {
        assert_eq!(TaskOutcome::Cancelled.channel(), OutcomeChannel::Failed);
        assert_eq!(TaskOutcome::Failed.channel(), OutcomeChannel::Failed);
        assert_eq!(TaskOutcome::Excepted("x".into()).channel(), OutcomeChannel::Excepted);
    }
}
