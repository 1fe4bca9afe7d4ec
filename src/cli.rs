use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedDevice {
    Cpu,
    Cuda,
}

impl EmbedDevice {
    pub fn as_str(self) -> &'static str {
        match self {
            EmbedDevice::Cpu => "cpu",
            EmbedDevice::Cuda => "cuda",
        }
    }
}

const CLI_EXAMPLES: &str = "Examples:\n\
  scantree --service mqtt --doc docs/mqtt-v5.txt plan\n\
  scantree --profile mqtt plan --requirements-file notes/requirements.txt --plan-file plans/mqtt.txt\n\
  scantree --service rtsp --doc docs/rfc2326.txt retrieve \"OPTIONS request format\" --top-k 3\n\
  scantree outline --service sip --doc-extract extracts/sip.txt --out outlines/sip.txt\n\
  scantree refine --plan plans/mqtt.txt --loss losses/round1.txt\n\
\n\
Profiles:\n\
  - Define [profiles.<name>] in .scantree/config.toml and select with --profile.\n\
  - Command-line flags and environment variables override profile values.";

#[derive(Debug, Parser)]
#[command(name = "scantree")]
#[command(about = "LLM probe-plan generator for unknown network services")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "SCANTREE_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "SCANTREE_CONFIG", default_value = ".scantree/config.toml")]
    pub config_path: String,

    #[arg(long, env = "SCANTREE_BACKEND_URL")]
    pub backend_url: Option<String>,

    #[arg(long, env = "SCANTREE_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "SCANTREE_SERVICE")]
    pub service: Option<String>,

    /// Document file to index; repeat for multiple documents.
    #[arg(long = "doc")]
    pub docs: Vec<String>,

    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub max_plan_iterations: Option<usize>,

    #[arg(long)]
    pub max_tool_iterations: Option<usize>,

    #[arg(long)]
    pub embed_model: Option<String>,

    #[arg(long, value_enum)]
    pub embed_device: Option<EmbedDevice>,

    #[arg(long)]
    pub chunk_size: Option<usize>,

    #[arg(long)]
    pub chunk_overlap: Option<usize>,

    #[arg(long)]
    pub default_top_k: Option<usize>,

    #[arg(long, env = "SCANTREE_PERSIST_DIR")]
    pub persist_dir: Option<String>,

    #[arg(long)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long)]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run the planner loop and print the resulting probe plan")]
    Plan {
        /// Task prompt; the built-in planner prompt is used when omitted.
        prompt: Vec<String>,
        #[arg(long, conflicts_with = "prompt")]
        prompt_file: Option<String>,
        #[arg(long)]
        requirements: Option<String>,
        #[arg(long, conflicts_with = "requirements")]
        requirements_file: Option<String>,
        /// Also write the plan to this file.
        #[arg(long)]
        plan_file: Option<String>,
    },
    #[command(about = "Query the document index in-process (no tool server subprocess)")]
    Retrieve {
        #[arg(required = true)]
        query: Vec<String>,
        #[arg(long)]
        top_k: Option<i64>,
    },
    #[command(about = "Generate a coding outline for a scanning plugin from a documentation extract")]
    Outline {
        #[arg(long)]
        doc_extract: String,
        #[arg(long)]
        out: Option<String>,
    },
    #[command(about = "Generate scanning plugin code from an outline and an example plugin")]
    Codegen {
        #[arg(long)]
        outline: String,
        #[arg(long)]
        example: String,
        #[arg(long)]
        out: Option<String>,
    },
    #[command(about = "Apply one gradient/apply refinement pass to a plan given a loss description")]
    Refine {
        #[arg(long)]
        plan: String,
        #[arg(long)]
        loss: String,
        #[arg(long)]
        out: Option<String>,
    },
    #[command(about = "Validate backend credentials, documents, and tool server configuration")]
    Doctor,
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}
