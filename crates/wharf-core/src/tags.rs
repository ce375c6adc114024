use std::collections::BTreeSet;

use anyhow::Result;
use once_cell::sync::Lazy;

/// Operating systems recognized in build constraints and file names.
pub static KNOWN_GOOS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "aix", "android", "darwin", "dragonfly", "freebsd", "hurd", "illumos", "ios", "js",
        "linux", "nacl", "netbsd", "openbsd", "plan9", "solaris", "wasip1", "windows", "zos",
    ]
    .into_iter()
    .collect()
});

/// Architectures recognized in build constraints and file names.
pub static KNOWN_GOARCH: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "386", "amd64", "arm", "arm64", "loong64", "mips", "mips64", "mips64le", "mipsle",
        "ppc64", "ppc64le", "riscv64", "s390x", "wasm",
    ]
    .into_iter()
    .collect()
});

/// Tags implied by a GOOS beyond the GOOS itself.
pub fn implied_tags(goos: &str) -> Vec<&'static str> {
    match goos {
        "aix" | "android" | "darwin" | "dragonfly" | "freebsd" | "hurd" | "illumos" | "ios"
        | "linux" | "netbsd" | "openbsd" | "solaris" | "zos" => vec!["unix"],
        _ => Vec::new(),
    }
}

/// A parsed `//go:build` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    Tag(String),
    Not(Box<Constraint>),
    And(Box<Constraint>, Box<Constraint>),
    Or(Box<Constraint>, Box<Constraint>),
}

impl Constraint {
    pub fn eval(&self, satisfied: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Constraint::Tag(tag) => satisfied(tag),
            Constraint::Not(inner) => !inner.eval(satisfied),
            Constraint::And(a, b) => a.eval(satisfied) && b.eval(satisfied),
            Constraint::Or(a, b) => a.eval(satisfied) || b.eval(satisfied),
        }
    }

    /// Every tag mentioned anywhere in the expression.
    pub fn tags(&self, out: &mut BTreeSet<String>) {
        match self {
            Constraint::Tag(tag) => {
                out.insert(tag.clone());
            }
            Constraint::Not(inner) => inner.tags(out),
            Constraint::And(a, b) | Constraint::Or(a, b) => {
                a.tags(out);
                b.tags(out);
            }
        }
    }
}

/// Parse the expression part of a `//go:build` line.
pub fn parse_constraint(expr: &str) -> Result<Constraint> {
    let mut parser = Parser {
        tokens: tokenize(expr)?,
        pos: 0,
    };
    let constraint = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        anyhow::bail!("trailing tokens in build constraint: {expr:?}");
    }
    Ok(constraint)
}

#[derive(Debug, PartialEq)]
enum Token {
    Ident(String),
    Not,
    And,
    Or,
    Open,
    Close,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    anyhow::bail!("single '&' in build constraint: {expr:?}");
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    anyhow::bail!("single '|' in build constraint: {expr:?}");
                }
                tokens.push(Token::Or);
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => anyhow::bail!("unexpected {other:?} in build constraint: {expr:?}"),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn or_expr(&mut self) -> Result<Constraint> {
        let mut left = self.and_expr()?;
        while matches!(self.tokens.get(self.pos), Some(Token::Or)) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Constraint::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Constraint> {
        let mut left = self.unary()?;
        while matches!(self.tokens.get(self.pos), Some(Token::And)) {
            self.pos += 1;
            let right = self.unary()?;
            left = Constraint::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Constraint> {
        match self.tokens.get(self.pos) {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Constraint::Not(Box::new(self.unary()?)))
            }
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.or_expr()?;
                if !matches!(self.tokens.get(self.pos), Some(Token::Close)) {
                    anyhow::bail!("missing ')' in build constraint");
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Ident(_)) => {
                let Some(Token::Ident(ident)) = self.tokens.get(self.pos) else {
                    unreachable!()
                };
                let tag = ident.clone();
                self.pos += 1;
                Ok(Constraint::Tag(tag))
            }
            _ => anyhow::bail!("malformed build constraint"),
        }
    }
}

/// Find the `//go:build` line in a source file, if any.
pub fn build_line(source: &str) -> Option<&str> {
    for line in source.lines() {
        let trimmed = line.trim_start();
        if let Some(expr) = trimmed.strip_prefix("//go:build") {
            return Some(expr.trim());
        }
        // Constraints must precede the package clause.
        if trimmed.starts_with("package ") {
            break;
        }
    }
    None
}

/// Implicit constraint carried by a file name (`x_linux.go`,
/// `x_linux_amd64.go`, `x_amd64.go`). Returns the tags that must all hold.
pub fn filename_constraint(name: &str) -> Option<Vec<String>> {
    let stem = name.strip_suffix(".go")?;
    let stem = stem.strip_suffix("_test").unwrap_or(stem);
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 2 {
        return None;
    }
    let last = parts[parts.len() - 1];
    let second_last = if parts.len() >= 3 {
        Some(parts[parts.len() - 2])
    } else {
        None
    };

    if KNOWN_GOARCH.contains(last) {
        if let Some(goos) = second_last.filter(|t| KNOWN_GOOS.contains(t)) {
            return Some(vec![goos.to_string(), last.to_string()]);
        }
        return Some(vec![last.to_string()]);
    }
    if KNOWN_GOOS.contains(last) {
        return Some(vec![last.to_string()]);
    }
    None
}

/// Combined constraint for a file: the `//go:build` line (if present) and
/// the file-name suffix, both of which must hold.
pub fn file_constraint(name: &str, source: Option<&str>) -> Result<Option<Constraint>> {
    let mut constraint = match source.and_then(build_line) {
        Some(expr) => Some(parse_constraint(expr)?),
        None => None,
    };
    if let Some(tags) = filename_constraint(name) {
        for tag in tags {
            let tag = Constraint::Tag(tag);
            constraint = Some(match constraint {
                Some(existing) => Constraint::And(Box::new(existing), Box::new(tag)),
                None => tag,
            });
        }
    }
    Ok(constraint)
}

/// Append a build tag to a source file per the tag comment protocol: combine
/// with an existing constraint under `op` (`&&`, `||`), or replace it when
/// `op` is empty. The rewritten block is prefixed with `notice` and precedes
/// the package clause. Legacy `// +build` lines are dropped so they cannot
/// contradict the rewritten constraint.
pub fn append_build_tag(source: &str, tag: &str, op: &str, notice: &str) -> String {
    let mut out = String::with_capacity(source.len() + notice.len() + tag.len() + 32);
    let mut inserted = false;

    for line in source.lines() {
        let trimmed = line.trim_start();
        if !inserted {
            if let Some(expr) = trimmed.strip_prefix("//go:build") {
                let expr = expr.trim();
                let combined = if op.is_empty() || expr.is_empty() {
                    tag.to_string()
                } else {
                    format!("({expr}) {op} {tag}")
                };
                out.push_str(&format!("// {notice}\n//go:build {combined}\n"));
                inserted = true;
                continue;
            }
            if trimmed.starts_with("// +build") {
                continue;
            }
            if trimmed.starts_with("package ") {
                out.push_str(&format!("// {notice}\n//go:build {tag}\n\n"));
                inserted = true;
            }
        } else if trimmed.starts_with("// +build") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn satisfied<'a>(tags: &'a [&'a str]) -> impl Fn(&str) -> bool + 'a {
        move |tag| tags.contains(&tag)
    }

    #[test]
    fn parses_and_evaluates_expressions() {
        let c = parse_constraint("linux || (darwin && !arm64)").unwrap();
        assert!(c.eval(&satisfied(&["linux"])));
        assert!(c.eval(&satisfied(&["darwin", "amd64"])));
        assert!(!c.eval(&satisfied(&["darwin", "arm64"])));
        assert!(!c.eval(&satisfied(&["windows"])));

        let mut tags = BTreeSet::new();
        c.tags(&mut tags);
        let tags: Vec<&str> = tags.iter().map(|s| s.as_str()).collect();
        assert_eq!(tags, vec!["arm64", "darwin", "linux"]);
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(parse_constraint("linux &").is_err());
        assert!(parse_constraint("(linux").is_err());
        assert!(parse_constraint("linux darwin").is_err());
    }

    #[test]
    fn filename_constraints() {
        assert_eq!(
            filename_constraint("file_linux.go"),
            Some(vec!["linux".to_string()])
        );
        assert_eq!(
            filename_constraint("file_linux_amd64.go"),
            Some(vec!["linux".to_string(), "amd64".to_string()])
        );
        assert_eq!(
            filename_constraint("file_amd64.go"),
            Some(vec!["amd64".to_string()])
        );
        assert_eq!(filename_constraint("file.go"), None);
        assert_eq!(filename_constraint("linux.go"), None);
        assert_eq!(filename_constraint("file_other.go"), None);
    }

    #[test]
    fn appends_tag_to_existing_constraint() {
        let src = "//go:build linux || darwin\n\npackage p\n";
        let out = append_build_tag(src, "!zos", "&&", "Tags altered by Wharf (added !zos)");
        assert!(out.contains("// Tags altered by Wharf (added !zos)\n"));
        assert!(out.contains("//go:build (linux || darwin) && !zos\n"));
        let c = parse_constraint(build_line(&out).unwrap()).unwrap();
        assert!(!c.eval(&satisfied(&["linux", "zos"])));
        assert!(c.eval(&satisfied(&["linux"])));
    }

    #[test]
    fn replaces_constraint_when_op_is_empty() {
        let src = "//go:build linux\n\npackage p\n";
        let out = append_build_tag(src, "zos", "", "This file was generated by Wharf (original p.go)");
        assert!(out.contains("//go:build zos\n"));
        assert!(!out.contains("//go:build linux"));
    }

    #[test]
    fn inserts_constraint_before_package_clause() {
        let src = "// Package p does things.\npackage p\n\nfunc F() {}\n";
        let out = append_build_tag(src, "zos", "||", "Tags altered by Wharf (added zos)");
        let build = out.lines().position(|l| l.starts_with("//go:build")).unwrap();
        let package = out.lines().position(|l| l.starts_with("package ")).unwrap();
        assert!(build < package);
        assert!(out.contains("//go:build zos\n"));
    }

    #[test]
    fn drops_legacy_plus_build_lines() {
        let src = "//go:build linux\n// +build linux\n\npackage p\n";
        let out = append_build_tag(src, "!zos", "&&", "notice");
        assert!(!out.contains("+build"));
    }
}
