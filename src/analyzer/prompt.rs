use crate::analyzer::AnalysisRequest;

const OUTPUT_LIMIT: usize = 4_000;

#[derive(Debug, Clone)]
pub struct LlmPrompt {
    pub system: String,
    pub user: String,
}

pub fn build_prompt(request: &AnalysisRequest, system_override: Option<&str>) -> LlmPrompt {
    let system = system_override
        .map(str::to_owned)
        .unwrap_or_else(system_prompt);

    LlmPrompt {
        system,
        user: user_prompt(request),
    }
}

/* ============================================================
   System prompt (stable, reused)
   ============================================================ */

fn system_prompt() -> String {
    r#"
You are a senior software testing assistant. Given a failing test of a
command-line program, explain the root cause and concrete fix steps.
If the mismatch is only formatting, propose normalization rules
(strip, collapse_ws, lower, sort_lines, regex_extract(pattern)).

Reply with STRICT JSON ONLY, no markdown, exactly this shape:
{"root_cause": "...", "suggested_fix": "...", "confidence": 0.0}
"#
    .trim()
    .to_string()
}

/* ============================================================
   User prompt (derived from the finished case)
   ============================================================ */

fn user_prompt(r: &AnalysisRequest) -> String {
    let mut out = String::new();

    out.push_str("COMMAND\n");
    out.push_str(&r.command);
    out.push_str("\n\n");

    out.push_str(&format!("CASE: {}\nVERDICT: {}\n", r.case.id, r.verdict));
    if let Some(reason) = &r.reason {
        out.push_str(&format!("REASON: {reason}\n"));
    }
    if !r.case.normalizers.is_empty() {
        out.push_str(&format!("NORMALIZERS: {}\n", r.case.normalizers.canonical()));
    }
    out.push('\n');

    section(&mut out, "INPUT", &r.case.input.as_text());

    if let Some(expected) = &r.expected_normalized {
        section(&mut out, "EXPECTED (normalized)", expected);
    }
    if let Some(actual) = &r.actual_normalized {
        section(&mut out, "ACTUAL (normalized)", actual);
    } else {
        section(&mut out, "ACTUAL STDOUT", &r.result.stdout);
    }

    out.push_str(&format!(
        "EXIT CODE: {}\nTIMED OUT: {}\n\n",
        r.result
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".into()),
        r.result.timed_out
    ));

    if !r.result.stderr.trim().is_empty() {
        section(&mut out, "STDERR", &r.result.stderr);
    }

    out.push_str(
        "Answer with: the likely root cause (cite concrete fragments), the minimal fix, \
         and any normalization rule that would make a formatting-only mismatch pass.",
    );
    out
}

fn section(out: &mut String, title: &str, body: &str) {
    out.push_str(title);
    out.push_str(":\n");
    out.push_str(&truncate(body));
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out.push('\n');
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= OUTPUT_LIMIT {
        return s.to_string();
    }
    let head: String = s.chars().take(OUTPUT_LIMIT).collect();
    format!("{head}\n...truncated...")
}
