use agent_scheduler::error::get_error_info;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub const fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Text
        }
    }
}

pub fn emit_output(output: OutputFormat, command: &str, payload: &serde_json::Value) {
    match output {
        OutputFormat::Text => payload
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| println!("{payload}"), |msg| println!("{msg}")),
        OutputFormat::Json => println!(
            "{}",
            json!({
                "command": command,
                "status": "ok",
                "payload": payload,
            })
        ),
    }
}

pub fn emit_error(output: OutputFormat, command: &str, code: &str, message: &str) {
    let fix = get_error_info(code).map_or("", |(_, fix)| fix);
    match output {
        OutputFormat::Text => {
            eprintln!("error[{code}]: {message}");
            if !fix.is_empty() {
                eprintln!("  hint: {fix}");
            }
        }
        OutputFormat::Json => println!(
            "{}",
            json!({
                "command": command,
                "status": "error",
                "code": code,
                "message": message,
                "fix": fix,
            })
        ),
    }
}
