//! The hidden runtime instruction and how it is combined with the user's prompt.

use crate::error::CosError;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

const USER_REQUEST_MARKER: &str = "User request:";
const STDIN_PROMPT: &str = "-";

pub struct HiddenInstruction<'a> {
    pub app_mcp_name: &'a str,
    pub app_mcp_url: &'a str,
    pub extra_system_prompt: &'a str,
    pub has_user_prompt: bool,
    pub runtime_workspace_id: &'a str,
}

impl HiddenInstruction<'_> {
    pub fn build(&self) -> String {
        let preamble = format!(
            "COS wrapper runtime instructions:\n\
             - The application MCP server is preconfigured and available in this session.\n\
             - Server name: {}\n\
             - Server URL: {}\n\
             - Use this MCP when the request touches workspace/project/task/specification/note/rule data.\n\
             - The workspace context below is auto-detected from the active application runtime.\n\
             - Unless the user explicitly asks for a different workspace, use the detected workspace_id directly in MCP calls.\n\
             - For coding requests, implement directly in the current repository: edit files, run commands, run tests, and report concrete results.\n\
             - Do not ask the user to manually configure or enable this MCP server.\n",
            self.app_mcp_name, self.app_mcp_url
        );
        let mut blocks = vec![preamble];
        if !self.runtime_workspace_id.is_empty() {
            blocks.push(format!(
                "Detected application workspace:\n- Active workspace_id: {}",
                self.runtime_workspace_id
            ));
        }
        if !self.extra_system_prompt.is_empty() {
            blocks.push(format!(
                "Additional COS system instructions:\n{}",
                self.extra_system_prompt
            ));
        }
        if !self.has_user_prompt {
            blocks.push(
                "No initial user request was provided. Reply with one short readiness message and wait."
                    .to_string(),
            );
        }
        blocks.join("\n\n").trim().to_string()
    }
}

/// The hidden instruction always leads; user text follows the literal marker.
pub fn compose_prompt(hidden_instruction: &str, user_prompt: &str) -> String {
    let user_text = user_prompt.trim();
    if user_text.is_empty() {
        return hidden_instruction.to_string();
    }
    format!("{hidden_instruction}\n\n{USER_REQUEST_MARKER}\n{user_text}")
        .trim()
        .to_string()
}

/// A prompt of `-` means "read it from stdin" when the caller allows it.
pub fn resolve_user_prompt<R: Read>(
    raw: &str,
    allow_stdin: bool,
    stdin: R,
) -> Result<String, CosError> {
    if raw == STDIN_PROMPT && allow_stdin {
        let mut text = String::new();
        let mut stdin = stdin;
        stdin.read_to_string(&mut text)?;
        return Ok(text.trim().to_string());
    }
    Ok(raw.trim().to_string())
}

/// Missing or non-regular files read as empty.
pub fn load_text_file(path: &Path) -> Result<String, CosError> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => return Ok(String::new()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => {
            return Err(CosError::Runtime(format!(
                "Failed to read system prompt file '{}': {err}",
                path.display()
            )))
        }
    }
    fs::read_to_string(path)
        .map(|text| text.trim().to_string())
        .map_err(|err| {
            CosError::Runtime(format!(
                "Failed to read system prompt file '{}': {err}",
                path.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn instruction<'a>(extra: &'a str, has_user_prompt: bool, workspace: &'a str) -> String {
        HiddenInstruction {
            app_mcp_name: "task-tools",
            app_mcp_url: "http://x/mcp",
            extra_system_prompt: extra,
            has_user_prompt,
            runtime_workspace_id: workspace,
        }
        .build()
    }

    #[test]
    fn hidden_instruction_names_the_server() {
        let text = instruction("", true, "");
        assert!(text.starts_with("COS wrapper runtime instructions:"));
        assert!(text.contains("- Server name: task-tools"));
        assert!(text.contains("- Server URL: http://x/mcp"));
        assert!(!text.contains("Detected application workspace"));
        assert!(!text.contains("No initial user request"));
        assert!(!text.ends_with('\n'));
    }

    #[test]
    fn hidden_instruction_appends_optional_blocks_in_order() {
        let text = instruction("Always run tests.", false, "ws-42");
        let workspace = text.find("- Active workspace_id: ws-42").unwrap();
        let extra = text
            .find("Additional COS system instructions:\nAlways run tests.")
            .unwrap();
        let waiting = text.find("No initial user request was provided").unwrap();
        assert!(workspace < extra && extra < waiting);
        assert!(text.contains("\n\nDetected application workspace:"));
    }

    #[test]
    fn compose_prompt_includes_user_request_section() {
        let prompt = compose_prompt("system", "  implement feature \n");
        assert_eq!(prompt, "system\n\nUser request:\nimplement feature");
    }

    #[test]
    fn compose_prompt_without_user_text_is_the_instruction() {
        assert_eq!(compose_prompt("system", "   "), "system");
    }

    #[test]
    fn dash_reads_prompt_from_stdin() {
        let prompt = resolve_user_prompt("-", true, "  fix bug\n".as_bytes()).unwrap();
        assert_eq!(prompt, "fix bug");
    }

    #[test]
    fn dash_is_literal_when_stdin_is_not_allowed() {
        let prompt = resolve_user_prompt("-", false, "ignored".as_bytes()).unwrap();
        assert_eq!(prompt, "-");
        let prompt = resolve_user_prompt("  hello ", true, "ignored".as_bytes()).unwrap();
        assert_eq!(prompt, "hello");
    }

    #[test]
    fn load_text_file_trims_and_tolerates_missing_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("system.md");
        assert_eq!(load_text_file(&path).unwrap(), "");
        fs::write(&path, "\n  be terse  \n").unwrap();
        assert_eq!(load_text_file(&path).unwrap(), "be terse");
        assert_eq!(load_text_file(dir.path()).unwrap(), "");
    }
}
