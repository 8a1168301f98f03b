//! Self-contained verification scripts.
//!
//! Every script embeds its inputs as a JSON literal, evaluates each case, and
//! prints exactly one JSON report as its last line of output. A pattern or
//! code snippet that fails to load is reported through `compileError` with an
//! exit code of 0; only a crash of the interpreter itself exits non-zero.

use serde_json::json;

use crate::error::Result;
use crate::request::{CodeTask, RegexRequest, Runtime};
use crate::result::{CodeCandidate, RegexCandidate};

const PAYLOAD_MARKER: &str = "__PAYLOAD__";

const JS_PRELUDE: &str = r#""use strict";
const payload = JSON.parse(__PAYLOAD__);

function emit(report) {
  console.log(JSON.stringify(report));
}

function failCompile(mode, error) {
  const message = error && error.message ? error.message : String(error);
  emit({ passed: false, total: 0, passedCount: 0, failedCount: 0, results: [], testMode: mode, compileError: message });
}

function finish(mode, results) {
  const passedCount = results.filter((r) => r.passed).length;
  emit({
    passed: passedCount === results.length,
    total: results.length,
    passedCount,
    failedCount: results.length - passedCount,
    results,
    testMode: mode,
  });
}
"#;

const JS_MATCH: &str = r#"
let re = null;
try {
  re = new RegExp(payload.pattern, payload.flags);
} catch (e) {
  failCompile("match", e);
}

if (re !== null) {
  const test = (input) => {
    re.lastIndex = 0;
    const matched = re.test(input);
    re.lastIndex = 0;
    return matched;
  };
  const results = [];
  for (const input of payload.shouldMatch) {
    const actual = test(input);
    results.push({ input, expected: true, actual, passed: actual === true });
  }
  for (const input of payload.shouldNotMatch) {
    const actual = test(input);
    results.push({ input, expected: false, actual, passed: actual === false });
  }
  finish("match", results);
}
"#;

const JS_CAPTURE: &str = r#"
const orNull = (v) => (v === undefined ? null : v);

function sameGroups(actual, expected) {
  if (actual.length !== expected.length) return false;
  return actual.every((v, i) => v === expected[i]);
}

function sameNamed(actual, expected) {
  const actualKeys = Object.keys(actual).sort();
  const expectedKeys = Object.keys(expected).sort();
  if (actualKeys.length !== expectedKeys.length) return false;
  return expectedKeys.every((k, i) => actualKeys[i] === k && actual[k] === expected[k]);
}

let re = null;
try {
  re = new RegExp(payload.pattern, payload.flags);
} catch (e) {
  failCompile("capture", e);
}

if (re !== null) {
  const results = [];
  for (const t of payload.captureTests) {
    re.lastIndex = 0;
    const m = re.exec(t.input);
    re.lastIndex = 0;
    let actual = null;
    let namedGroups;
    if (m !== null) {
      actual = m.slice(1).map(orNull);
      if (m.groups) {
        namedGroups = {};
        for (const [k, v] of Object.entries(m.groups)) namedGroups[k] = orNull(v);
      }
    }
    let passed = actual !== null && sameGroups(actual, t.expectedGroups);
    if (passed && t.expectedNamedGroups) {
      passed = namedGroups !== undefined && sameNamed(namedGroups, t.expectedNamedGroups);
    }
    const entry = { input: t.input, expected: t.expectedGroups, actual, passed };
    if (namedGroups !== undefined) entry.namedGroups = namedGroups;
    results.push(entry);
  }
  finish("capture", results);
}
"#;

const JS_CODE: &str = r#"
function canonical(v) {
  if (v === undefined || v === null) return "null";
  if (Array.isArray(v)) return "[" + v.map(canonical).join(",") + "]";
  if (typeof v === "object") {
    return "{" + Object.keys(v).sort().map((k) => JSON.stringify(k) + ":" + canonical(v[k])).join(",") + "}";
  }
  const json = JSON.stringify(v);
  return json === undefined ? "null" : json;
}

let solve = null;
try {
  solve = new Function(payload.code + "\nreturn typeof solve === \"function\" ? solve : null;")();
  if (typeof solve !== "function") {
    solve = null;
    failCompile("code", "code does not define a function named solve");
  }
} catch (e) {
  solve = null;
  failCompile("code", e);
}

if (solve !== null) {
  const results = [];
  for (const c of payload.testCases) {
    try {
      const json = canonical(solve(c.input));
      const actual = JSON.parse(json);
      results.push({ input: c.input, expected: c.expected, actual, passed: json === canonical(c.expected) });
    } catch (e) {
      const error = e && e.message ? e.message : String(e);
      results.push({ input: c.input, expected: c.expected, actual: null, passed: false, error });
    }
  }
  finish("code", results);
}
"#;

const PY_PRELUDE: &str = r#"import json
import re

payload = json.loads(__PAYLOAD__)

FLAGS = {
    "i": re.IGNORECASE,
    "m": re.MULTILINE,
    "s": re.DOTALL,
    "x": re.VERBOSE,
    "a": re.ASCII,
    "u": 0,
    "g": 0,
}


def emit(report):
    print(json.dumps(report))


def fail_compile(mode, error):
    emit({"passed": False, "total": 0, "passedCount": 0, "failedCount": 0,
          "results": [], "testMode": mode, "compileError": str(error)})


def finish(mode, results):
    passed_count = sum(1 for r in results if r["passed"])
    emit({"passed": passed_count == len(results), "total": len(results),
          "passedCount": passed_count, "failedCount": len(results) - passed_count,
          "results": results, "testMode": mode})


def compile_pattern(pattern, flags):
    value = 0
    for flag in flags:
        if flag not in FLAGS:
            raise ValueError("unsupported flag '%s'" % flag)
        value |= FLAGS[flag]
    return re.compile(pattern, value)
"#;

const PY_MATCH: &str = r#"
try:
    rx = compile_pattern(payload["pattern"], payload["flags"])
except (re.error, ValueError) as e:
    fail_compile("match", e)
else:
    results = []
    for text in payload["shouldMatch"]:
        actual = rx.search(text) is not None
        results.append({"input": text, "expected": True, "actual": actual, "passed": actual})
    for text in payload["shouldNotMatch"]:
        actual = rx.search(text) is not None
        results.append({"input": text, "expected": False, "actual": actual, "passed": not actual})
    finish("match", results)
"#;

const PY_CAPTURE: &str = r#"
try:
    rx = compile_pattern(payload["pattern"], payload["flags"])
except (re.error, ValueError) as e:
    fail_compile("capture", e)
else:
    results = []
    for t in payload["captureTests"]:
        m = rx.search(t["input"])
        actual = None
        named = None
        if m is not None:
            actual = list(m.groups())
            if rx.groupindex:
                named = m.groupdict()
        passed = actual is not None and actual == t["expectedGroups"]
        expected_named = t.get("expectedNamedGroups")
        if passed and expected_named is not None:
            passed = named is not None and named == expected_named
        entry = {"input": t["input"], "expected": t["expectedGroups"], "actual": actual, "passed": passed}
        if named is not None:
            entry["namedGroups"] = named
        results.append(entry)
    finish("capture", results)
"#;

const PY_CODE: &str = r#"
solve = None
try:
    namespace = {}
    exec(compile(payload["code"], "<candidate>", "exec"), namespace)
    solve = namespace.get("solve")
    if not callable(solve):
        solve = None
        fail_compile("code", "code does not define a function named solve")
except Exception as e:
    solve = None
    fail_compile("code", "%s: %s" % (type(e).__name__, e))

if solve is not None:
    results = []
    for case in payload["testCases"]:
        try:
            actual = json.loads(json.dumps(solve(case["input"])))
            results.append({"input": case["input"], "expected": case["expected"],
                            "actual": actual, "passed": actual == case["expected"]})
        except Exception as e:
            results.append({"input": case["input"], "expected": case["expected"],
                            "actual": None, "passed": False,
                            "error": "%s: %s" % (type(e).__name__, e)})
    finish("code", results)
"#;

fn assemble(prelude: &str, body: &str, payload: &serde_json::Value) -> Result<String> {
    let literal = serde_json::to_string(&payload.to_string())?;
    let mut script = prelude.replace(PAYLOAD_MARKER, &literal);
    script.push_str(body);
    Ok(script)
}

/// Builds the verification script for a regex candidate.
pub fn regex_script(
    runtime: Runtime,
    candidate: &RegexCandidate,
    request: &RegexRequest,
) -> Result<String> {
    let (payload, body) = match request {
        RegexRequest::Match(m) => (
            json!({
                "pattern": candidate.pattern,
                "flags": candidate.flags,
                "shouldMatch": m.should_match,
                "shouldNotMatch": m.should_not_match,
            }),
            match runtime {
                Runtime::Javascript => JS_MATCH,
                Runtime::Python => PY_MATCH,
            },
        ),
        RegexRequest::Capture(c) => (
            json!({
                "pattern": candidate.pattern,
                "flags": candidate.flags,
                "captureTests": c.capture_tests,
            }),
            match runtime {
                Runtime::Javascript => JS_CAPTURE,
                Runtime::Python => PY_CAPTURE,
            },
        ),
    };

    assemble(prelude(runtime), body, &payload)
}

/// Builds the verification script for a code candidate.
pub fn code_script(runtime: Runtime, candidate: &CodeCandidate, task: &CodeTask) -> Result<String> {
    let payload = json!({
        "code": candidate.code,
        "testCases": task.test_cases,
    });
    let body = match runtime {
        Runtime::Javascript => JS_CODE,
        Runtime::Python => PY_CODE,
    };
    assemble(prelude(runtime), body, &payload)
}

fn prelude(runtime: Runtime) -> &'static str {
    match runtime {
        Runtime::Javascript => JS_PRELUDE,
        Runtime::Python => PY_PRELUDE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CaptureTest, CodeTestCase};

    fn digits() -> RegexRequest {
        RegexRequest::matching("digits", vec!["123".to_string()], vec!["abc".to_string()])
    }

    fn embedded_payload(script: &str, opener: &str) -> serde_json::Value {
        let start = script.find(opener).unwrap() + opener.len();
        let end = script[start..].find(");\n").or_else(|| script[start..].find(")\n")).unwrap();
        let literal: String = serde_json::from_str(&script[start..start + end]).unwrap();
        serde_json::from_str(&literal).unwrap()
    }

    #[test]
    fn javascript_match_script_embeds_payload() {
        let script = regex_script(Runtime::Javascript, &RegexCandidate::new("\\d+", "g"), &digits())
            .unwrap();

        assert!(!script.contains(PAYLOAD_MARKER));
        assert!(script.contains("new RegExp(payload.pattern, payload.flags)"));
        let payload = embedded_payload(&script, "JSON.parse(");
        assert_eq!(payload["pattern"], "\\d+");
        assert_eq!(payload["flags"], "g");
        assert_eq!(payload["shouldNotMatch"][0], "abc");
    }

    #[test]
    fn python_capture_script_embeds_tests() {
        let request = RegexRequest::capturing(
            "dates",
            vec![CaptureTest {
                input: "2024-01-15".to_string(),
                expected_groups: vec![Some("2024".to_string()), None],
                expected_named_groups: None,
            }],
        );
        let script = regex_script(
            Runtime::Python,
            &RegexCandidate::new("(\\d{4})-(x)?", ""),
            &request,
        )
        .unwrap();

        assert!(script.contains("m.groups()"));
        let payload = embedded_payload(&script, "json.loads(");
        assert_eq!(payload["captureTests"][0]["expectedGroups"][1], serde_json::Value::Null);
    }

    #[test]
    fn hostile_input_stays_inside_the_literal() {
        let request = RegexRequest::matching(
            "quotes",
            vec!["\"); process.exit(1); (\"".to_string(), "line\nbreak'''".to_string()],
            vec![],
        );
        let script = regex_script(Runtime::Javascript, &RegexCandidate::new("a", ""), &request)
            .unwrap();

        let payload = embedded_payload(&script, "JSON.parse(");
        assert_eq!(payload["shouldMatch"][0], "\"); process.exit(1); (\"");
        assert_eq!(payload["shouldMatch"][1], "line\nbreak'''");
    }

    #[test]
    fn code_script_embeds_candidate_and_cases() {
        let task = CodeTask {
            description: "count words".to_string(),
            test_cases: vec![CodeTestCase {
                input: "a b".to_string(),
                expected: serde_json::json!(2),
            }],
        };
        let candidate = CodeCandidate {
            reasoning: "split".to_string(),
            code: "def solve(s):\n    return len(s.split())".to_string(),
        };

        let script = code_script(Runtime::Python, &candidate, &task).unwrap();
        assert!(script.contains("exec(compile("));
        let payload = embedded_payload(&script, "json.loads(");
        assert_eq!(payload["testCases"][0]["expected"], 2);
        assert!(payload["code"].as_str().unwrap().starts_with("def solve"));
    }
}
