//! Tool invocation specs and the built-in tool table.
//!
//! Argv templates are expanded element by element. Supported placeholders:
//!
//! | Placeholder     | Value                                              |
//! |-----------------|----------------------------------------------------|
//! | `{target}`      | Target hostname                                    |
//! | `{workspace}`   | Workspace directory                                |
//! | `{out}`         | Output file for this job                           |
//! | `{input}`       | The tool's `input` file resolved in the workspace  |
//! | `{item}`        | Current input line when `fan_out` is set           |
//! | `{concurrency}` | Current max concurrency                            |
//! | `{rate}`        | Current requests per period                        |
//! | `{timeout}`     | Current per-job timeout in seconds                 |

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

use crate::phase::Phase;
use crate::throttle::Budget;

const PLACEHOLDERS: &[&str] = &[
    "target",
    "workspace",
    "out",
    "input",
    "item",
    "concurrency",
    "rate",
    "timeout",
];

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").unwrap());

/// One external tool invocation within a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique within the phase; names log and artifact files
    pub name: String,
    /// Program followed by its arguments, each a template
    pub argv: Vec<String>,
    /// Output file name inside the phase directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Workspace-relative input file; the tool is skipped when it is missing or empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Run once per input line, substituting `{item}`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fan_out: bool,
    /// Tools in a higher stage start after every lower stage has finished
    #[serde(default, skip_serializing_if = "is_zero")]
    pub stage: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl ToolSpec {
    pub fn new(name: &str, argv: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            output: None,
            input: None,
            fan_out: false,
            stage: 0,
        }
    }

    pub fn output(mut self, file: &str) -> Self {
        self.output = Some(file.to_string());
        self
    }

    pub fn input(mut self, path: &str) -> Self {
        self.input = Some(path.to_string());
        self
    }

    pub fn fan_out(mut self) -> Self {
        self.fan_out = true;
        self
    }

    pub fn stage(mut self, stage: u32) -> Self {
        self.stage = stage;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn output_file(&self) -> String {
        self.output
            .clone()
            .unwrap_or_else(|| format!("{}.txt", self.name))
    }

    /// Whether the tool writes `{out}` itself instead of printing results.
    pub fn writes_own_output(&self) -> bool {
        self.argv.iter().any(|a| a.contains("{out}"))
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("tool name must not be empty".to_string());
        }
        if self.program().trim().is_empty() {
            problems.push(format!("tool '{}' has an empty argv", self.name));
        }
        for unknown in unknown_placeholders(&self.argv) {
            problems.push(format!(
                "tool '{}' uses unknown placeholder {{{}}}",
                self.name, unknown
            ));
        }
        if self.fan_out && self.input.is_none() {
            problems.push(format!("tool '{}' sets fan_out without an input", self.name));
        }
        if self.argv.iter().any(|a| a.contains("{item}")) && !self.fan_out {
            problems.push(format!(
                "tool '{}' uses {{item}} but does not set fan_out",
                self.name
            ));
        }
        problems
    }
}

/// Placeholders in `argv` that `expand` does not know.
pub fn unknown_placeholders(argv: &[String]) -> Vec<String> {
    argv.iter()
        .flat_map(|a| PLACEHOLDER_RE.captures_iter(a))
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|name| !PLACEHOLDERS.contains(name))
        .map(String::from)
        .collect()
}

/// Values substituted into argv templates.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub target: &'a str,
    pub workspace: &'a Path,
    pub out: &'a Path,
    pub input: Option<&'a Path>,
    pub item: Option<&'a str>,
    pub budget: &'a Budget,
}

/// Expand one argv element. Unknown placeholders are left untouched.
pub fn expand(template: &str, vars: &TemplateVars<'_>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match name {
                "target" => vars.target.to_string(),
                "workspace" => vars.workspace.display().to_string(),
                "out" => vars.out.display().to_string(),
                "input" => vars
                    .input
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                "item" => vars.item.unwrap_or_default().to_string(),
                "concurrency" => vars.budget.max_concurrency.to_string(),
                "rate" => vars.budget.rate_limit.to_string(),
                "timeout" => vars.budget.timeout_secs.to_string(),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Built-in tools for a phase.
pub fn default_tools(phase: Phase) -> Vec<ToolSpec> {
    match phase {
        Phase::Recon => vec![
            ToolSpec::new("subfinder", &["subfinder", "-d", "{target}", "-all", "-silent"])
                .output("subdomains.txt"),
            ToolSpec::new(
                "httpx",
                &[
                    "httpx", "-l", "{input}", "-silent", "-rl", "{rate}", "-t", "{concurrency}",
                ],
            )
            .input("recon/subdomains.txt")
            .output("live.txt")
            .stage(1),
        ],
        Phase::TakeoverCheck => vec![
            ToolSpec::new(
                "nuclei-takeover",
                &["nuclei", "-l", "{input}", "-tags", "takeover", "-silent", "-rl", "{rate}"],
            )
            .input("recon/subdomains.txt")
            .output("takeovers.txt"),
        ],
        Phase::PortScan => vec![
            ToolSpec::new(
                "naabu",
                &["naabu", "-list", "{input}", "-silent", "-rate", "{rate}", "-o", "{out}"],
            )
            .input("recon/subdomains.txt")
            .output("ports.txt"),
        ],
        Phase::Crawl => vec![
            ToolSpec::new(
                "katana",
                &[
                    "katana", "-list", "{input}", "-silent", "-c", "{concurrency}", "-rl", "{rate}",
                ],
            )
            .input("recon/live.txt")
            .output("urls.txt"),
        ],
        Phase::Secrets => vec![
            ToolSpec::new(
                "nuclei-exposures",
                &["nuclei", "-l", "{input}", "-tags", "exposure,token", "-silent", "-rl", "{rate}"],
            )
            .input("crawl/urls.txt")
            .output("exposures.txt"),
            ToolSpec::new(
                "trufflehog",
                &["trufflehog", "filesystem", "{workspace}/crawl", "--json", "--no-update"],
            )
            .output("trufflehog.jsonl"),
        ],
        Phase::Fuzz => vec![
            ToolSpec::new(
                "ffuf",
                &[
                    "ffuf",
                    "-u",
                    "{item}/FUZZ",
                    "-w",
                    "/usr/share/wordlists/dirb/common.txt",
                    "-mc",
                    "200,204,301,302,307,401,403",
                    "-rate",
                    "{rate}",
                    "-s",
                ],
            )
            .input("recon/live.txt")
            .output("paths.txt")
            .fan_out(),
        ],
        Phase::Screenshot => vec![
            ToolSpec::new(
                "gowitness",
                &[
                    "gowitness",
                    "scan",
                    "file",
                    "-f",
                    "{input}",
                    "--screenshot-path",
                    "{workspace}/screenshot/shots",
                ],
            )
            .input("recon/live.txt")
            .output("gowitness.log"),
        ],
        Phase::Cloud => vec![
            ToolSpec::new("cloud-enum", &["cloud_enum", "-k", "{target}", "-l", "{out}"])
                .output("buckets.txt"),
        ],
        Phase::LeakSearch => vec![
            ToolSpec::new(
                "trufflehog-github",
                &["trufflehog", "github", "--org={target}", "--json", "--no-update"],
            )
            .output("github-leaks.jsonl"),
        ],
        Phase::VulnerabilityScan => vec![
            ToolSpec::new(
                "nuclei",
                &[
                    "nuclei", "-l", "{input}", "-silent", "-rl", "{rate}", "-c", "{concurrency}",
                    "-timeout", "{timeout}",
                ],
            )
            .input("recon/live.txt")
            .output("vulnerabilities.txt"),
        ],
        Phase::Done => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars<'a>(budget: &'a Budget, out: &'a Path) -> TemplateVars<'a> {
        TemplateVars {
            target: "example.com",
            workspace: Path::new("/ws"),
            out,
            input: Some(Path::new("/ws/recon/live.txt")),
            item: Some("https://a.example.com"),
            budget,
        }
    }

    #[test]
    fn test_expand_placeholders() {
        let budget = Budget::default();
        let out = Path::new("/ws/crawl/urls.txt");
        let v = vars(&budget, out);
        assert_eq!(expand("{target}", &v), "example.com");
        assert_eq!(expand("--org={target}", &v), "--org=example.com");
        assert_eq!(expand("{item}/FUZZ", &v), "https://a.example.com/FUZZ");
        assert_eq!(expand("{input}", &v), "/ws/recon/live.txt");
        assert_eq!(expand("{workspace}/crawl", &v), "/ws/crawl");
        assert_eq!(expand("{rate}", &v), budget.rate_limit.to_string());
        assert_eq!(expand("{nope}", &v), "{nope}");
    }

    #[test]
    fn test_expand_never_splits_arguments() {
        let budget = Budget::default();
        let out = Path::new("/ws/out.txt");
        let mut v = vars(&budget, out);
        v.item = Some("a.example.com; rm -rf /");
        assert_eq!(expand("{item}", &v), "a.example.com; rm -rf /");
    }

    #[test]
    fn test_default_tools_validate() {
        for phase in Phase::pipeline() {
            let tools = default_tools(phase);
            assert!(!tools.is_empty(), "{} has no tools", phase);
            for tool in tools {
                assert!(tool.validate().is_empty(), "{:?}", tool.validate());
            }
        }
        assert!(default_tools(Phase::Done).is_empty());
    }

    #[test]
    fn test_validate_flags_bad_specs() {
        let spec = ToolSpec::new("x", &["x", "{item}", "{bogus}"]);
        let problems = spec.validate();
        assert!(problems.iter().any(|p| p.contains("{bogus}")));
        assert!(problems.iter().any(|p| p.contains("fan_out")));

        let spec = ToolSpec::new("y", &[]);
        assert!(spec.validate().iter().any(|p| p.contains("empty argv")));
    }

    #[test]
    fn test_output_file_defaults_to_name() {
        assert_eq!(ToolSpec::new("katana", &["katana"]).output_file(), "katana.txt");
        assert!(ToolSpec::new("n", &["naabu", "-o", "{out}"]).writes_own_output());
    }

    #[test]
    fn test_spec_toml_shape() {
        let spec: ToolSpec = toml::from_str(
            r#"
name = "dnsx"
argv = ["dnsx", "-l", "{input}", "-silent"]
input = "recon/subdomains.txt"
"#,
        )
        .unwrap();
        assert_eq!(spec.program(), "dnsx");
        assert!(!spec.fan_out);
        assert_eq!(spec.stage, 0);
    }
}
