use clap::{CommandFactory, FromArgMatches, Parser};
use serde::Deserialize;
use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::api::DEFAULT_API_BASE;
use crate::error::{Error, Result};
use crate::output::OutputFlags;

const API_KEY_VAR: &str = "OPENAI_API_KEY";

#[derive(Debug, Parser)]
#[clap(
    name = "aix",
    version,
    about = "A command-line tool to send a prompt to an LLM completion API. Reads from STDIN when input is piped."
)]
pub struct Options {
    #[clap(
        short('p'),
        long,
        value_name = "PROMPT",
        help = "Prompt to query; a file path or a string, may be repeated"
    )]
    pub prompt: Vec<String>,

    #[clap(
        value_name = "WORDS",
        help = "Prompt words, used when neither STDIN nor --prompt supply one"
    )]
    pub args: Vec<String>,

    #[clap(long, visible_alias("g3"), help = "Use the GPT-3.5 model (the default)")]
    pub gpt3: bool,

    #[clap(long, visible_alias("g4"), help = "Use the GPT-4 model")]
    pub gpt4: bool,

    #[clap(
        short('m'),
        long,
        value_name = "MODEL_ID",
        help = "Model to use, overrides --gpt3 and --gpt4 (ex: gpt-4-0314)"
    )]
    pub model: Option<String>,

    #[clap(long, visible_alias("lm"), help = "List the available models")]
    pub list_models: bool,

    #[clap(
        long("openai-api-key"),
        visible_alias("ak"),
        value_name = "API_KEY",
        help = "API key, a string or a file; if absent the envvar 'OPENAI_API_KEY' is checked"
    )]
    pub api_key: Option<String>,

    #[clap(
        long("api"),
        value_name = "URL",
        help = "The API base URL to use [default: https://api.openai.com/v1]"
    )]
    pub api: Option<String>,

    #[clap(
        short('t'),
        long,
        value_name = "F32",
        help = "Sets the temperature for sampling"
    )]
    pub temperature: Option<String>,

    #[clap(
        long("topp"),
        visible_alias("tp"),
        value_name = "F32",
        help = "Include only the top tokens whose probabilities add up to P when sampling"
    )]
    pub top_p: Option<String>,

    #[clap(
        long,
        visible_alias("sc"),
        value_name = "SYSTEM",
        help = "System message sent before the prompt; a file path or a string, may be repeated"
    )]
    pub system_context: Vec<String>,

    #[clap(short('s'), long, help = "Write the response to stdout as it's received")]
    pub stream: bool,

    #[clap(short('o'), long, value_name = "FILE", help = "File to write the output to")]
    pub output: Option<PathBuf>,

    #[clap(short('j'), long, help = "Write output as a single JSON line")]
    pub jsonl: bool,

    #[clap(short('v'), long, help = "Verbose mode")]
    pub verbose: bool,

    #[clap(long, help = "Only print the result")]
    pub silent: bool,
}

impl Options {
    /// Parses the process arguments, naming the command after the running tool.
    /// Exits the process on `--help`, `--version` or malformed flags.
    pub fn parse_as(name: &'static str, about: &'static str) -> Self {
        let matches = Options::command()
            .name(name)
            .bin_name(name)
            .about(about)
            .get_matches();
        Options::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
    }
}

/// Optional defaults read from `<config dir>/<tool>/config.yaml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub openai_api_key: Option<String>,
    pub api: Option<String>,
    pub model: Option<String>,
    pub gpt4: Option<bool>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub system: Vec<String>,
    pub stream: Option<bool>,
}

impl FileConfig {
    /// Loads the file, or `None` when it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&contents).map_err(|source| Error::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(config))
    }

    /// The per-tool location, ex: `~/.config/aix/config.yaml`.
    pub fn default_path(tool: &str) -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(tool).join("config.yaml"))
    }
}

/// What the process was started with besides its flags.
#[derive(Debug, Default, Clone)]
pub struct Environment {
    // Piped standard input, if any
    pub stdin: Option<String>,
    pub api_key: Option<String>,
    pub config_path: Option<PathBuf>,
}

impl Environment {
    pub fn from_process(tool: &str) -> Result<Self> {
        let stdin = if io::stdin().is_terminal() {
            None
        } else {
            let mut input = String::new();
            io::stdin().read_to_string(&mut input)?;
            Some(input)
        };

        Ok(Environment {
            stdin: stdin.filter(|s| !s.is_empty()),
            api_key: env::var(API_KEY_VAR).ok().filter(|k| !k.is_empty()),
            config_path: FileConfig::default_path(tool),
        })
    }
}

/// The fully resolved settings for one invocation.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub api_key: Option<String>,
    pub api: String,
    pub prompt: String,
    pub model: Option<String>,
    pub gpt4: bool,
    pub list_models: bool,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub system: Vec<String>,
    pub stream: bool,
    pub output: Option<PathBuf>,
    pub jsonl: bool,
    pub verbose: bool,
    pub silent: bool,
}

impl Config {
    /// Merges the flags with standard input, the environment and the config
    /// file.
    ///
    /// The prompt comes from piped input first, then `--prompt`, then the
    /// trailing words. The API key comes from the flag, then `OPENAI_API_KEY`,
    /// then the config file; the file is only read when no key was found
    /// earlier, and then also fills any setting the flags left unset.
    pub fn resolve(options: Options, environment: &Environment) -> Result<Self> {
        let prompt = match &environment.stdin {
            Some(input) => input.clone(),
            None => {
                let prompt = read_values(&options.prompt)?.join("\n");
                if prompt.is_empty() {
                    options.args.join(" ")
                } else {
                    prompt
                }
            }
        };

        let flag_key = match &options.api_key {
            Some(key) => Some(read_value(key)?.trim().to_string()),
            None => None,
        };

        if options.gpt3 && options.gpt4 {
            debug!("both --gpt3 and --gpt4 given, using gpt4");
        }

        let mut config = Config {
            api_key: flag_key
                .filter(|k| !k.is_empty())
                .or_else(|| environment.api_key.clone()),
            api: options.api.unwrap_or_default(),
            prompt,
            model: options.model.filter(|m| !m.is_empty()),
            gpt4: options.gpt4,
            list_models: options.list_models,
            temperature: parse_float(options.temperature.as_deref()),
            top_p: parse_float(options.top_p.as_deref()),
            system: read_lines(&options.system_context)?,
            stream: options.stream,
            output: options.output,
            jsonl: options.jsonl,
            verbose: options.verbose,
            silent: options.silent,
        };

        if config.api_key.is_none() {
            if let Some(path) = &environment.config_path {
                if let Some(file) = FileConfig::load(path)? {
                    debug!(path = %path.display(), "loaded config file");
                    config.apply_file(file);
                }
            }
        }
        if config.api.is_empty() {
            config.api = DEFAULT_API_BASE.to_string();
        }

        if config.stream && config.jsonl {
            return Err(Error::IncompatibleFlags);
        }
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        self.api_key = file.openai_api_key.filter(|k| !k.is_empty());
        if self.api.is_empty() {
            self.api = file.api.unwrap_or_default();
        }
        if self.model.is_none() {
            self.model = file.model.filter(|m| !m.is_empty());
        }
        self.gpt4 |= file.gpt4.unwrap_or(false);
        self.temperature = self.temperature.or(file.temperature.filter(|v| v.is_finite()));
        self.top_p = self.top_p.or(file.top_p.filter(|v| v.is_finite()));
        if self.system.is_empty() {
            self.system = file.system;
        }
        self.stream |= file.stream.unwrap_or(false);
    }

    pub fn output_flags(&self) -> OutputFlags {
        OutputFlags {
            jsonl: self.jsonl,
            verbose: self.verbose,
            silent: self.silent,
        }
    }
}

/// A float given as text; anything that does not parse counts as unset.
fn parse_float(raw: Option<&str>) -> Option<f32> {
    let raw = raw?.trim();
    match raw.parse::<f32>() {
        Ok(value) if value.is_finite() => Some(value),
        _ => {
            debug!(value = raw, "ignoring malformed number");
            None
        }
    }
}

// A flag value naming an existing file stands for that file's contents.
fn read_value(value: &str) -> Result<String> {
    let path = Path::new(value);
    if path.is_file() {
        Ok(std::fs::read_to_string(path)?)
    } else {
        Ok(value.to_string())
    }
}

fn read_values(values: &[String]) -> Result<Vec<String>> {
    values.iter().map(|v| read_value(v)).collect()
}

// Like `read_values`, but files contribute one entry per non-blank line.
fn read_lines(values: &[String]) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for value in values {
        if Path::new(value).is_file() {
            let contents = read_value(value)?;
            lines.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string),
            );
        } else {
            lines.push(value.clone());
        }
    }
    Ok(lines)
}
