//! Response parser - extracts executable code blocks from model output
//!
//! Code is recognised only inside fenced blocks that open at the start of a
//! line with three backticks and a language tag, and close with a line holding
//! only three backticks. Blocks tagged with the executable language are pulled
//! out and replaced by a `[code block N]` placeholder; every other block stays
//! in the prose untouched. An unterminated fence is never partially extracted:
//! everything from the opening fence to the end of the text is kept as prose.
//!
//! ```text
//! "Sure.\n```python\nprint(1)\n```\nDone."
//!        │
//!        ▼
//! prose: "Sure.\n[code block 1]\nDone."   code_blocks: [python: "print(1)"]
//! ```

use lazy_static::lazy_static;
use regex::Regex;

use crate::types::{Artifact, CodeBlock, ExecutionResult};

const FENCE: &str = "```";

/// Result of parsing one model response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Prose with extracted blocks replaced by placeholders
    pub prose: String,
    /// Executable blocks in order of appearance
    pub code_blocks: Vec<CodeBlock>,
    /// An unterminated fence was seen, or the response held nothing usable
    pub malformed: bool,
}

impl ParsedResponse {
    pub fn has_code(&self) -> bool {
        !self.code_blocks.is_empty()
    }

    /// Re-expand placeholders into fenced blocks
    pub fn render(&self) -> String {
        render(&self.prose, &self.code_blocks, &[])
    }
}

/// Placeholder text standing in for the `index`-th (0-based) extracted block
pub fn placeholder(index: usize) -> String {
    format!("[code block {}]", index + 1)
}

/// Extracts code for a single executable language
#[derive(Debug, Clone)]
pub struct ResponseParser {
    language: String,
    aliases: Vec<String>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new("python")
    }
}

impl ResponseParser {
    /// Create a parser for `language`; known aliases are accepted as well
    pub fn new(language: impl Into<String>) -> Self {
        let language = language.into().to_ascii_lowercase();
        let aliases = match language.as_str() {
            "python" => vec!["python", "py", "python3"],
            "javascript" => vec!["javascript", "js", "node"],
            "bash" => vec!["bash", "sh", "shell"],
            _ => vec![],
        }
        .into_iter()
        .map(String::from)
        .collect();
        Self { language, aliases }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    fn is_executable(&self, tag: &str) -> bool {
        let tag = tag.to_ascii_lowercase();
        tag == self.language || self.aliases.iter().any(|a| *a == tag)
    }

    /// Split a raw model response into prose and executable code blocks
    pub fn parse(&self, raw: &str) -> ParsedResponse {
        let mut prose = String::with_capacity(raw.len());
        let mut code_blocks = Vec::new();
        let mut malformed = false;

        let mut open: Option<OpenFence> = None;

        for line in raw.split_inclusive('\n') {
            let bare = line.trim_end_matches(['\n', '\r']);

            match open.take() {
                None => match opening_tag(bare) {
                    Some(tag) => {
                        open = Some(OpenFence {
                            tag: tag.to_string(),
                            raw: line.to_string(),
                            body: Vec::new(),
                        });
                    }
                    None => prose.push_str(line),
                },
                Some(mut fence) => {
                    fence.raw.push_str(line);
                    if bare.trim() != FENCE {
                        fence.body.push(bare.to_string());
                        open = Some(fence);
                        continue;
                    }

                    let source = fence.body.join("\n");
                    if !fence.tag.is_empty() && self.is_executable(&fence.tag) {
                        if source.trim().is_empty() {
                            // Nothing to run; drop the empty block entirely
                            continue;
                        }
                        prose.push_str(&placeholder(code_blocks.len()));
                        if line.ends_with('\n') {
                            prose.push('\n');
                        }
                        code_blocks.push(CodeBlock::new(self.language.clone(), source));
                    } else {
                        prose.push_str(&fence.raw);
                    }
                }
            }
        }

        if let Some(fence) = open.take() {
            malformed = true;
            prose.push_str(&fence.raw);
        }

        let prose = prose.trim().to_string();
        if prose.is_empty() && code_blocks.is_empty() {
            malformed = true;
        }

        ParsedResponse {
            prose,
            code_blocks,
            malformed,
        }
    }
}

struct OpenFence {
    tag: String,
    raw: String,
    body: Vec<String>,
}

/// Language tag of an opening fence line, `Some("")` for an untagged fence
fn opening_tag(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix(FENCE)?;
    let tag = rest.trim();
    // Inline spans such as ```x``` and info strings with spaces are not fences
    if tag.contains('`') || tag.contains(char::is_whitespace) {
        return None;
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '_' | '.' | '#'))
    {
        return None;
    }
    Some(tag)
}

/// Replace placeholders with fenced code, inlining execution output
pub fn render(prose: &str, code_blocks: &[CodeBlock], executions: &[ExecutionResult]) -> String {
    let mut rendered = prose.to_string();
    for (i, block) in code_blocks.iter().enumerate() {
        let mut replacement = block.to_fence();
        if let Some(result) = executions.get(i) {
            match result.error_text() {
                None if !result.stdout.trim().is_empty() => {
                    let stdout = result.stdout.trim_end();
                    replacement.push_str(&format!("\nOutput:\n```\n{}\n```", stdout));
                }
                None => {}
                Some(err) => {
                    replacement.push_str(&format!("\nError:\n```\n{}\n```", err.trim_end()));
                }
            }
        }
        rendered = rendered.replacen(&placeholder(i), &replacement, 1);
    }
    rendered
}

lazy_static! {
    static ref IMAGE_EMBED: Regex =
        Regex::new(r"\n*!\[[^\]]*\]\(([^)\s]*)\)").expect("valid image embed regex");
    static ref SANDBOX_LINK: Regex =
        Regex::new(r"\[([^\]]*)\]\(sandbox:[^)]*\)").expect("valid sandbox link regex");
}

/// Remove image embeds and sandbox download links that point at artifacts
///
/// Produced files are delivered as artifacts, so links the model writes to
/// them would be dead for the caller.
pub fn strip_artifact_links(content: &str, artifacts: &[Artifact]) -> String {
    let without_images = IMAGE_EMBED.replace_all(content, |caps: &regex::Captures<'_>| {
        let target = &caps[1];
        let refers_to_artifact = target.starts_with("sandbox:")
            || artifacts
                .iter()
                .any(|a| !a.name.is_empty() && target.ends_with(a.name.as_str()));
        if refers_to_artifact {
            String::new()
        } else {
            caps[0].to_string()
        }
    });
    SANDBOX_LINK
        .replace_all(&without_images, "$1")
        .trim()
        .to_string()
}
