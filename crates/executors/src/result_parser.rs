use db::models::conversation_result::CreateConversationResult;
use regex::Regex;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::ParseError;

/// Tail depth and strictness for [`ResultParser::parse`] (SPEC_FULL.md §4.4,
/// §6.1 `XSHA_PARSER_*` config).
#[derive(Debug, Clone, Copy)]
pub struct ParserConfig {
    pub max_log_lines: usize,
    pub strict_validation: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self { max_log_lines: 1000, strict_validation: false }
    }
}

/// A [`ConversationResult`](db::models::conversation_result::ConversationResult)
/// before the owning `execution_log_id` is known.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResult {
    pub subtype: String,
    pub is_error: bool,
    pub session_id: String,
    pub duration_ms: Option<i64>,
    pub duration_api_ms: Option<i64>,
    pub num_turns: Option<i64>,
    pub result: String,
    pub total_cost_usd: Option<f64>,
    pub usage: Option<Value>,
}

impl ParsedResult {
    pub fn into_create(self, execution_log_id: Uuid) -> CreateConversationResult {
        CreateConversationResult {
            execution_log_id,
            subtype: self.subtype,
            is_error: self.is_error,
            session_id: self.session_id,
            duration_ms: self.duration_ms,
            duration_api_ms: self.duration_api_ms,
            num_turns: self.num_turns,
            result: self.result,
            total_cost_usd: self.total_cost_usd,
            usage: self.usage,
        }
    }
}

trait ParseStrategy: Send + Sync {
    fn try_parse(&self, log_text: &str, cfg: &ParserConfig) -> Option<Result<ParsedResult, ParseError>>;
}

/// Triggered by a plan-mode completion: an `assistant` message whose content
/// includes a `tool_use` call named `ExitPlanMode`. Takes priority over
/// [`JsonResultStrategy`] so a plan's own trailing chatter is never mistaken
/// for a normal `result` object.
struct PlanModeStrategy;

impl ParseStrategy for PlanModeStrategy {
    fn try_parse(&self, log_text: &str, _cfg: &ParserConfig) -> Option<Result<ParsedResult, ParseError>> {
        for line in log_text.lines() {
            let obj: Value = match serde_json::from_str(strip_wrapper_prefix(line)) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if obj.get("type").and_then(Value::as_str) != Some("assistant") {
                continue;
            }
            let Some(plan) = find_exit_plan_mode_input(&obj) else { continue };
            let Some(session_id) = obj.get("session_id").and_then(Value::as_str) else { continue };

            return Some(Ok(ParsedResult {
                subtype: "plan_mode".to_string(),
                is_error: false,
                session_id: session_id.to_string(),
                duration_ms: Some(0),
                duration_api_ms: Some(0),
                num_turns: Some(0),
                result: plan,
                total_cost_usd: Some(0.0),
                usage: None,
            }));
        }
        None
    }
}

fn find_exit_plan_mode_input(assistant_obj: &Value) -> Option<String> {
    let content = assistant_obj.get("message")?.get("content")?.as_array()?;
    for item in content {
        if item.get("type").and_then(Value::as_str) == Some("tool_use")
            && item.get("name").and_then(Value::as_str) == Some("ExitPlanMode")
        {
            let plan = item.get("input")?.get("plan")?.as_str()?;
            if !plan.trim().is_empty() {
                return Some(plan.to_string());
            }
        }
    }
    None
}

/// Scans the last `cfg.max_log_lines` lines for a standalone `type="result"`
/// object, skipping any `type="assistant"` line along the way.
struct JsonResultStrategy;

impl ParseStrategy for JsonResultStrategy {
    fn try_parse(&self, log_text: &str, cfg: &ParserConfig) -> Option<Result<ParsedResult, ParseError>> {
        let lines: Vec<&str> = log_text.lines().collect();
        let tail_start = lines.len().saturating_sub(cfg.max_log_lines);

        for line in lines[tail_start..].iter().rev() {
            let obj: Value = match serde_json::from_str(strip_wrapper_prefix(line)) {
                Ok(v) => v,
                Err(_) => continue,
            };
            match obj.get("type").and_then(Value::as_str) {
                Some("result") => return Some(parse_result_object(&obj, cfg)),
                _ => continue,
            }
        }
        None
    }
}

fn parse_result_object(obj: &Value, cfg: &ParserConfig) -> Result<ParsedResult, ParseError> {
    let subtype = obj
        .get("subtype")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ParseError::MissingField("subtype"))?
        .to_string();
    let is_error = obj.get("is_error").and_then(Value::as_bool).ok_or(ParseError::WrongFieldType("is_error"))?;
    let session_id = obj
        .get("session_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ParseError::MissingField("session_id"))?
        .to_string();
    let result = obj.get("result").and_then(Value::as_str).unwrap_or_default().to_string();

    let duration_ms = obj.get("duration_ms").and_then(Value::as_i64);
    let duration_api_ms = obj.get("duration_api_ms").and_then(Value::as_i64);
    let num_turns = obj.get("num_turns").and_then(Value::as_i64);
    let total_cost_usd = obj.get("total_cost_usd").and_then(Value::as_f64);
    let usage = obj.get("usage").cloned();

    if cfg.strict_validation {
        if duration_ms.is_none() { return Err(ParseError::MissingField("duration_ms")); }
        if duration_api_ms.is_none() { return Err(ParseError::MissingField("duration_api_ms")); }
        if num_turns.is_none() { return Err(ParseError::MissingField("num_turns")); }
        if total_cost_usd.is_none() { return Err(ParseError::MissingField("total_cost_usd")); }
        if usage.is_none() { return Err(ParseError::MissingField("usage")); }
    }

    Ok(ParsedResult {
        subtype,
        is_error,
        session_id,
        duration_ms,
        duration_api_ms,
        num_turns,
        result,
        total_cost_usd,
        usage,
    })
}

/// Strips a wrapper prefix some log producers add, e.g. `[14:03:02] INFO: `,
/// before attempting to parse a line as JSON. Compiled once: this runs on
/// every line of up to `max_log_lines` per parse, so recompiling the regex
/// per call would turn a bounded tail scan into its dominant cost.
fn strip_wrapper_prefix(line: &str) -> &str {
    static WRAPPER_PREFIX: std::sync::LazyLock<Regex> =
        std::sync::LazyLock::new(|| Regex::new(r"^\[\d{2}:\d{2}:\d{2}\]\s*\w+:\s*").expect("static regex"));
    match WRAPPER_PREFIX.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

/// Derives a [`ParsedResult`] from an execution log's full text. Per the
/// source's own design notes, this is the only parser shape implemented — no
/// factory/registry/cache sits in front of the two strategies, which are
/// tried in a fixed order built once at construction.
pub struct ResultParser {
    strategies: Vec<Box<dyn ParseStrategy>>,
}

impl Default for ResultParser {
    fn default() -> Self {
        Self {
            strategies: vec![Box::new(PlanModeStrategy), Box::new(JsonResultStrategy)],
        }
    }
}

impl ResultParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&self, log_text: &str, cfg: &ParserConfig) -> Result<ParsedResult, ParseError> {
        for strategy in &self.strategies {
            if let Some(outcome) = strategy.try_parse(log_text, cfg) {
                if outcome.is_err() {
                    warn!("result parse fallback exhausted: matched object failed validation");
                }
                return outcome;
            }
        }
        warn!(log_lines = log_text.lines().count(), "no parser strategy matched execution log");
        Err(ParseError::NoStrategyMatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_strategy_finds_trailing_result_object() {
        let log = "some agent chatter\n{\"type\":\"assistant\",\"session_id\":\"s1\"}\n{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"session_id\":\"s1\",\"result\":\"done\"}\n";
        let parsed = ResultParser::new().parse(log, &ParserConfig::default()).unwrap();
        assert_eq!(parsed.subtype, "success");
        assert_eq!(parsed.session_id, "s1");
        assert!(!parsed.is_error);
        assert!(parsed.duration_ms.is_none());
    }

    #[test]
    fn json_strategy_tolerates_wrapper_prefix() {
        let log = "[14:03:02] INFO: {\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"session_id\":\"s1\",\"result\":\"ok\"}\n";
        let parsed = ResultParser::new().parse(log, &ParserConfig::default()).unwrap();
        assert_eq!(parsed.result, "ok");
    }

    #[test]
    fn plan_mode_strategy_takes_priority_over_json_result() {
        let log = "{\"type\":\"assistant\",\"session_id\":\"s1\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"name\":\"ExitPlanMode\",\"input\":{\"plan\":\"do X then Y\"}}]}}\n{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"session_id\":\"s1\",\"result\":\"ignored\"}\n";
        let parsed = ResultParser::new().parse(log, &ParserConfig::default()).unwrap();
        assert_eq!(parsed.subtype, "plan_mode");
        assert_eq!(parsed.result, "do X then Y");
        assert_eq!(parsed.duration_ms, Some(0));
    }

    #[test]
    fn no_matching_object_is_a_parse_error() {
        let log = "just some free-form text\nno json here\n";
        let err = ResultParser::new().parse(log, &ParserConfig::default()).unwrap_err();
        assert!(matches!(err, ParseError::NoStrategyMatched));
    }

    #[test]
    fn strict_validation_rejects_missing_optional_numerics() {
        let log = "{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"session_id\":\"s1\",\"result\":\"ok\"}\n";
        let cfg = ParserConfig { max_log_lines: 1000, strict_validation: true };
        let err = ResultParser::new().parse(log, &cfg).unwrap_err();
        assert!(matches!(err, ParseError::MissingField(_)));
    }
}
