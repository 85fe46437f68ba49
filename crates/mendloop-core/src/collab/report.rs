//! Extract failing tests from common test-runner output.
//!
//! Recognised formats: `cargo test`, pytest, `go test` and jest. Anything
//! else yields no failures; the caller decides what a non-zero exit with no
//! recognised failures means.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use super::FailingTest;

struct Patterns {
    cargo: Regex,
    cargo_panic: Regex,
    pytest: Regex,
    go: Regex,
    go_location: Regex,
    jest: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        cargo: Regex::new(r"^test (\S+) \.\.\. FAILED$").expect("cargo pattern"),
        cargo_panic: Regex::new(r"^thread '([^']+)' panicked at (\S+?:\d+:\d+):?$")
            .expect("cargo panic pattern"),
        pytest: Regex::new(r"^(?:FAILED|ERROR) (\S+?)(?: - (.*))?$").expect("pytest pattern"),
        go: Regex::new(r"^\s*--- FAIL: (\S+) \([\d.]+s\)$").expect("go pattern"),
        go_location: Regex::new(r"^\s+(\S+_test\.go:\d+): (.*)$").expect("go location pattern"),
        jest: Regex::new(r"^\s*[✕×] (.+?)(?: \(\d+ ?m?s\))?$").expect("jest pattern"),
    })
}

/// Every distinct failing test found in `output`, in first-seen order.
pub fn parse_failures(output: &str) -> Vec<FailingTest> {
    let p = patterns();
    let mut found: Vec<FailingTest> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    // Panic locations and go log lines can appear before the summary line
    // that names the test, so they are collected separately and merged.
    let mut panics: HashMap<String, (String, String)> = HashMap::new();
    let mut go_pending: Option<(String, String)> = None;

    let mut push = |found: &mut Vec<FailingTest>, test: FailingTest| {
        if !index.contains_key(&test.id) {
            index.insert(test.id.clone(), found.len());
            found.push(test);
        }
    };

    let lines: Vec<&str> = output.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let line = line.trim_end();

        if let Some(c) = p.cargo_panic.captures(line) {
            let message = lines.get(i + 1).map(|l| l.trim().to_string()).unwrap_or_default();
            panics.insert(c[1].to_string(), (c[2].to_string(), message));
            continue;
        }
        if let Some(c) = p.cargo.captures(line) {
            push(&mut found, FailingTest::new(&c[1]));
            continue;
        }
        if let Some(c) = p.pytest.captures(line) {
            let id = c[1].to_string();
            let location = id.split("::").next().map(str::to_string);
            let detail = c.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
            push(
                &mut found,
                FailingTest {
                    id,
                    location,
                    detail,
                },
            );
            continue;
        }
        if let Some(c) = p.go_location.captures(line) {
            go_pending = Some((c[1].to_string(), c[2].to_string()));
            continue;
        }
        if let Some(c) = p.go.captures(line) {
            let (location, detail) = match go_pending.take() {
                Some((loc, msg)) => (Some(loc), msg),
                None => (None, String::new()),
            };
            push(
                &mut found,
                FailingTest {
                    id: c[1].to_string(),
                    location,
                    detail,
                },
            );
            continue;
        }
        if let Some(c) = p.jest.captures(line) {
            push(&mut found, FailingTest::new(c[1].trim()));
        }
    }

    for test in &mut found {
        if let Some((location, message)) = panics.remove(&test.id) {
            test.location = Some(location);
            test.detail = message;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cargo_output() {
        let out = "\
running 3 tests
test tests::ok ... ok
test tests::broken ... FAILED
test other::also_broken ... FAILED

failures:

---- tests::broken stdout ----
thread 'tests::broken' panicked at src/lib.rs:10:9:
assertion `left == right` failed
";
        let failing = parse_failures(out);
        assert_eq!(failing.len(), 2);
        assert_eq!(failing[0].id, "tests::broken");
        assert_eq!(failing[0].location.as_deref(), Some("src/lib.rs:10:9"));
        assert!(failing[0].detail.contains("assertion"));
        assert_eq!(failing[1].id, "other::also_broken");
    }

    #[test]
    fn test_pytest_summary() {
        let out = "\
=========================== short test summary info ============================
FAILED tests/test_api.py::test_login - AssertionError: 401 != 200
FAILED tests/test_api.py::test_logout
ERROR tests/test_db.py::test_connect - ConnectionError
";
        let failing = parse_failures(out);
        assert_eq!(failing.len(), 3);
        assert_eq!(failing[0].location.as_deref(), Some("tests/test_api.py"));
        assert_eq!(failing[0].detail, "AssertionError: 401 != 200");
        assert_eq!(failing[1].detail, "");
    }

    #[test]
    fn test_go_output() {
        let out = "\
=== RUN   TestAdd
    math_test.go:12: got 3, want 4
--- FAIL: TestAdd (0.00s)
=== RUN   TestSub
--- PASS: TestSub (0.00s)
FAIL
";
        let failing = parse_failures(out);
        assert_eq!(failing.len(), 1);
        assert_eq!(failing[0].id, "TestAdd");
        assert_eq!(failing[0].location.as_deref(), Some("math_test.go:12"));
        assert_eq!(failing[0].detail, "got 3, want 4");
    }

    #[test]
    fn test_jest_output() {
        let out = "  ✓ renders header (5 ms)\n  ✕ submits form (12 ms)\n";
        let failing = parse_failures(out);
        assert_eq!(failing, vec![FailingTest::new("submits form")]);
    }

    #[test]
    fn test_duplicates_collapsed_and_unknown_output_ignored() {
        let out = "test a ... FAILED\ntest a ... FAILED\nsomething unrelated\n";
        assert_eq!(parse_failures(out).len(), 1);
        assert!(parse_failures("all good\n").is_empty());
    }
}
