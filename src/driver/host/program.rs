//! Source analysis for host "builds".
//!
//! The host driver does not compile kernel code. A build checks that the
//! source survives `#error` directives under the given `-D` defines, finds
//! every `kernel void name(...)` declaration and counts its parameters.

use std::collections::HashMap;

/// Parse `-DNAME`, `-DNAME=VALUE` and `-D NAME=VALUE` options.
pub(crate) fn parse_defines(options: &str) -> HashMap<String, String> {
    let mut defines = HashMap::new();
    let mut words = options.split_whitespace();
    while let Some(word) = words.next() {
        let body = if word == "-D" {
            match words.next() {
                Some(next) => next,
                None => break,
            }
        } else if let Some(rest) = word.strip_prefix("-D") {
            rest
        } else {
            continue;
        };
        match body.split_once('=') {
            Some((name, value)) => defines.insert(name.to_string(), value.to_string()),
            None => defines.insert(body.to_string(), "1".to_string()),
        };
    }
    defines
}

/// Find the first `#error` directive that is live under `defines`.
///
/// Only `#ifdef`, `#ifndef`, `#else` and `#endif` are evaluated; any other
/// `#if` is treated as taken.
pub(crate) fn live_error_directive(
    source: &str,
    defines: &HashMap<String, String>,
) -> Option<(usize, String)> {
    let mut stack: Vec<bool> = Vec::new();
    for (line_no, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        let Some(directive) = trimmed.strip_prefix('#') else {
            continue;
        };
        let directive = directive.trim_start();
        let (keyword, rest) = directive
            .split_once(char::is_whitespace)
            .unwrap_or((directive, ""));
        let rest = rest.trim();
        let live = stack.iter().all(|&taken| taken);
        match keyword {
            "ifdef" => stack.push(defines.contains_key(rest)),
            "ifndef" => stack.push(!defines.contains_key(rest)),
            "if" => stack.push(true),
            "else" => {
                if let Some(top) = stack.last_mut() {
                    *top = !*top;
                }
            }
            "endif" => {
                stack.pop();
            }
            "error" if live => return Some((line_no + 1, rest.to_string())),
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Punct(char),
}

fn tokenize(source: &str) -> Vec<Token> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i += 2;
        } else if c == '#' {
            // Preprocessor lines never declare kernels.
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            if !c.is_whitespace() {
                tokens.push(Token::Punct(c));
            }
            i += 1;
        }
    }
    tokens
}

fn skip_attribute(tokens: &[Token], mut i: usize) -> usize {
    while let Some(Token::Ident(word)) = tokens.get(i) {
        if word != "__attribute__" {
            break;
        }
        i += 1;
        let mut depth = 0usize;
        while let Some(token) = tokens.get(i) {
            i += 1;
            match token {
                Token::Punct('(') => depth += 1,
                Token::Punct(')') => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    i
}

/// Every kernel entry point declared in `source`, with its parameter count.
pub(crate) fn scan_kernels(source: &str) -> Vec<(String, u32)> {
    let tokens = tokenize(source);
    let mut kernels = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let is_kernel = matches!(&tokens[i], Token::Ident(w) if w == "kernel" || w == "__kernel");
        i += 1;
        if !is_kernel {
            continue;
        }
        let mut j = skip_attribute(&tokens, i);
        if !matches!(tokens.get(j), Some(Token::Ident(w)) if w == "void") {
            continue;
        }
        j += 1;
        let Some(Token::Ident(name)) = tokens.get(j) else {
            continue;
        };
        if tokens.get(j + 1) != Some(&Token::Punct('(')) {
            continue;
        }
        j += 2;

        let mut depth = 1usize;
        let mut commas = 0u32;
        let mut words = Vec::new();
        while let Some(token) = tokens.get(j) {
            j += 1;
            match token {
                Token::Punct('(') => depth += 1,
                Token::Punct(')') => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                Token::Punct(',') if depth == 1 => commas += 1,
                Token::Ident(word) if depth == 1 => words.push(word.as_str()),
                _ => {}
            }
        }
        let args = if words.is_empty() || words == ["void"] {
            0
        } else {
            commas + 1
        };
        kernels.push((name.clone(), args));
        i = j;
    }
    kernels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defines() {
        let defines = parse_defines("-cl-fast-relaxed-math -DTILE=16 -D BATCH=4 -DVCL_GPU -I /tmp");
        assert_eq!(defines.get("TILE").map(String::as_str), Some("16"));
        assert_eq!(defines.get("BATCH").map(String::as_str), Some("4"));
        assert_eq!(defines.get("VCL_GPU").map(String::as_str), Some("1"));
        assert_eq!(defines.len(), 3);
    }

    #[test]
    fn test_scan_kernels() {
        let source = r#"
            // kernel void commented(int a)
            #define FOO 1
            __kernel void add(__global const float* a, __global const float* b,
                              __global float* out, const uint n) {
                out[get_global_id(0)] = a[0] + b[0];
            }
            kernel __attribute__((reqd_work_group_size(64, 1, 1))) void empty(void) {}
            kernel void none() {}
            /* kernel void hidden(int x) */
        "#;
        let kernels = scan_kernels(source);
        assert_eq!(
            kernels,
            vec![
                ("add".to_string(), 4),
                ("empty".to_string(), 0),
                ("none".to_string(), 0)
            ]
        );
    }

    #[test]
    fn test_error_directive_respects_ifdef() {
        let source = "#ifdef VCL_GPU\n#error gpu path unsupported\n#else\nint x;\n#endif\n";
        let mut defines = HashMap::new();
        assert!(live_error_directive(source, &defines).is_none());
        defines.insert("VCL_GPU".to_string(), "1".to_string());
        let (line, text) = live_error_directive(source, &defines).unwrap();
        assert_eq!(line, 2);
        assert_eq!(text, "gpu path unsupported");
    }

    #[test]
    fn test_error_directive_in_else_branch() {
        let source = "#ifndef NEEDED\n#error NEEDED missing\n#endif\n";
        let defines = parse_defines("-DNEEDED");
        assert!(live_error_directive(source, &defines).is_none());
        assert!(live_error_directive(source, &HashMap::new()).is_some());
    }
}
