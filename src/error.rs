use anyhow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Backend,
    Tooling,
    Resource,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Backend => "BACKEND",
            ErrorCategory::Tooling => "TOOLING",
            ErrorCategory::Resource => "RESOURCE",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Backend => {
                "Set SCANTREE_API_KEY (or OPENAI_API_KEY) and check --backend-url/--model."
            }
            ErrorCategory::Tooling => {
                "Review tool server configuration and retry with RUST_LOG=info for tool/transport logs."
            }
            ErrorCategory::Resource => {
                "Check that document paths exist and --persist-dir is writable, then retry."
            }
            ErrorCategory::Input => "Run scantree --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api key") || msg.contains("backend") || msg.contains("model") {
        return ErrorCategory::Backend;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
        || msg.contains("profile")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("document")
        || msg.contains("persist")
        || msg.contains("index")
        || msg.contains("cache")
    {
        return ErrorCategory::Resource;
    }

    if msg.contains("tool") || msg.contains("server") || msg.contains("transport") {
        return ErrorCategory::Tooling;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!("[{}] {}\nHint: {}", category.code(), err, category.hint())
}
