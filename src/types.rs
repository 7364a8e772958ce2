use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    #[default]
    Com,
    Cn,
}

impl Domain {
    pub fn as_str(&self) -> &str {
        match self {
            Domain::Com => "com",
            Domain::Cn => "cn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Task selector for `reset-state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TaskArg {
    Download,
    Delete,
    Index,
}

impl From<TaskArg> for crate::state::TaskKind {
    fn from(task: TaskArg) -> Self {
        match task {
            TaskArg::Download => Self::Download,
            TaskArg::Delete => Self::Delete,
            TaskArg::Index => Self::Index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskKind;

    #[test]
    fn test_domain_deserializes_lowercase() {
        let d: Domain = serde_json::from_str("\"cn\"").unwrap();
        assert_eq!(d, Domain::Cn);
        assert_eq!(d.as_str(), "cn");
        assert!(serde_json::from_str::<Domain>("\"org\"").is_err());
    }

    #[test]
    fn test_task_arg_maps_to_task_kind() {
        assert_eq!(TaskKind::from(TaskArg::Index), TaskKind::Index);
        assert_eq!(TaskKind::from(TaskArg::Delete), TaskKind::Delete);
    }
}
