//! Line-oriented config file editing
//!
//! All helpers are pure: they take the current text and return the text
//! with the directive in place. Applying one twice gives the same result
//! as applying it once.

/// Key of an assignment line (`key = v`, `key=v`, `key v`), or `None` for
/// blank lines, comments and section headers
fn assignment_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with(['#', ';', '[']) {
        return None;
    }
    let end = trimmed
        .find(|c: char| c == '=' || c.is_whitespace())
        .unwrap_or(trimmed.len());
    Some(&trimmed[..end])
}

fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Set `key` to `value` in a flat key/value file.
///
/// The first assignment of `key` is replaced and later duplicates are
/// dropped; a missing key is appended.
pub fn set_assignment(content: &str, key: &str, separator: &str, value: &str) -> String {
    let directive = format!("{key}{separator}{value}");
    let mut lines: Vec<String> = Vec::new();
    let mut placed = false;

    for line in content.lines() {
        if assignment_key(line) == Some(key) {
            if !placed {
                lines.push(directive.clone());
                placed = true;
            }
        } else {
            lines.push(line.to_string());
        }
    }

    if !placed {
        lines.push(directive);
    }
    join_lines(&lines)
}

/// Set `key=value` inside `[section]` of an INI file, creating the section
/// when it is missing
pub fn set_ini_key(content: &str, section: &str, key: &str, value: &str) -> String {
    let header = format!("[{section}]");
    let directive = format!("{key}={value}");
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    let Some(start) = lines.iter().position(|l| l.trim() == header) else {
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push(header);
        lines.push(directive);
        return join_lines(&lines);
    };

    let end = lines[start + 1..]
        .iter()
        .position(|l| l.trim_start().starts_with('['))
        .map(|offset| start + 1 + offset)
        .unwrap_or(lines.len());

    let matches = |l: &String| {
        l.trim_start()
            .split_once('=')
            .is_some_and(|(k, _)| k.trim() == key)
    };

    match lines[start + 1..end].iter().position(matches) {
        Some(offset) => lines[start + 1 + offset] = directive,
        None => {
            // After the last non-blank line of the section
            let mut insert_at = end;
            while insert_at > start + 1 && lines[insert_at - 1].trim().is_empty() {
                insert_at -= 1;
            }
            lines.insert(insert_at, directive);
        }
    }
    join_lines(&lines)
}

/// Replace the block between `begin` and `end` marker lines, or insert it
/// before the last closing brace (or at the end when there is none)
pub fn upsert_block(content: &str, begin: &str, end: &str, body: &[String]) -> String {
    let mut block = vec![begin.to_string()];
    block.extend(body.iter().cloned());
    block.push(end.to_string());

    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let begin_at = lines.iter().position(|l| l.trim() == begin);
    let end_at = lines.iter().position(|l| l.trim() == end);

    if let (Some(b), Some(e)) = (begin_at, end_at) {
        if b < e {
            let indent: String = lines[b].chars().take_while(|c| c.is_whitespace()).collect();
            lines.splice(b..=e, block.into_iter().map(|l| format!("{indent}{l}")));
            return join_lines(&lines);
        }
    }

    match lines.iter().rposition(|l| l.trim_end().ends_with('}')) {
        Some(brace) => {
            let indented = block.into_iter().map(|l| format!("  {l}"));
            lines.splice(brace..brace, indented);
        }
        None => lines.extend(block),
    }
    join_lines(&lines)
}

/// Make `command` the only active `XferCommand` under `[options]`.
///
/// A commented line that already names the same program is uncommented in
/// place; other active transfer commands are commented out.
pub fn enable_xfer_command(content: &str, command: &str) -> String {
    let program = command.split_whitespace().next().unwrap_or(command);
    let directive = format!("XferCommand = {command}");
    let mut lines: Vec<String> = Vec::new();
    let mut placed = false;

    for line in content.lines() {
        let trimmed = line.trim_start();
        let uncommented = trimmed.trim_start_matches('#').trim_start();
        let is_xfer = uncommented
            .split_once('=')
            .is_some_and(|(k, _)| k.trim() == "XferCommand");

        if !is_xfer {
            lines.push(line.to_string());
            continue;
        }

        let value = uncommented.split_once('=').map(|(_, v)| v.trim()).unwrap_or("");
        let commented = trimmed.starts_with('#');
        if value.starts_with(program) && !placed {
            lines.push(directive.clone());
            placed = true;
        } else if !commented {
            lines.push(format!("#{}", line.trim_start()));
        } else {
            lines.push(line.to_string());
        }
    }

    if !placed {
        match lines.iter().position(|l| l.trim() == "[options]") {
            Some(options) => lines.insert(options + 1, directive),
            None => {
                lines.push("[options]".to_string());
                lines.push(directive);
            }
        }
    }
    join_lines(&lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_assignment_replaces_and_dedups() {
        let content = "# comment\nuse_proxy = off\nhttp_proxy = http://old:1/\nuse_proxy=off\n";
        let out = set_assignment(content, "use_proxy", " = ", "on");
        assert_eq!(out, "# comment\nuse_proxy = on\nhttp_proxy = http://old:1/\n");
        assert_eq!(set_assignment(&out, "use_proxy", " = ", "on"), out);
    }

    #[test]
    fn test_set_assignment_appends_and_ignores_comments() {
        let out = set_assignment("#proxy = \"x\"\n", "proxy", " = ", "\"http://h:1\"");
        assert_eq!(out, "#proxy = \"x\"\nproxy = \"http://h:1\"\n");
        assert_eq!(set_assignment("", "proxy_http", " ", "h:1"), "proxy_http h:1\n");
    }

    #[test]
    fn test_set_ini_key_in_existing_section() {
        let content = "[Proxy Settings]\nProxyType=0\nNoProxyFor=\n\n[Other]\nhttpProxy=keep\n";
        let out = set_ini_key(content, "Proxy Settings", "ProxyType", "1");
        let out = set_ini_key(&out, "Proxy Settings", "httpProxy", "http://h 1");
        assert_eq!(
            out,
            "[Proxy Settings]\nProxyType=1\nNoProxyFor=\nhttpProxy=http://h 1\n\n[Other]\nhttpProxy=keep\n"
        );
        assert_eq!(set_ini_key(&out, "Proxy Settings", "httpProxy", "http://h 1"), out);
    }

    #[test]
    fn test_set_ini_key_creates_section() {
        let out = set_ini_key("[General]\na=b\n\n", "Proxy Settings", "ProxyType", "1");
        assert_eq!(out, "[General]\na=b\n\n[Proxy Settings]\nProxyType=1\n");
        assert_eq!(set_ini_key("", "S", "k", "v"), "[S]\nk=v\n");
    }

    #[test]
    fn test_upsert_block_before_last_brace() {
        let content = "{ config, pkgs, ... }:\n{\n  imports = [ ];\n}\n";
        let body = vec!["networking.proxy.default = \"http://h:1\";".to_string()];
        let out = upsert_block(content, "# begin", "# end", &body);
        assert_eq!(
            out,
            "{ config, pkgs, ... }:\n{\n  imports = [ ];\n  # begin\n  networking.proxy.default = \"http://h:1\";\n  # end\n}\n"
        );
        assert_eq!(upsert_block(&out, "# begin", "# end", &body), out);
    }

    #[test]
    fn test_enable_xfer_command() {
        let content = "[options]\n#XferCommand = /usr/bin/curl -L -C - -f -o %o %u\n#XferCommand = /usr/bin/wget --passive-ftp -c -O %o %u\n";
        let out = enable_xfer_command(content, "/usr/bin/wget --passive-ftp -c -O %o %u");
        assert_eq!(
            out,
            "[options]\n#XferCommand = /usr/bin/curl -L -C - -f -o %o %u\nXferCommand = /usr/bin/wget --passive-ftp -c -O %o %u\n"
        );
        assert_eq!(enable_xfer_command(&out, "/usr/bin/wget --passive-ftp -c -O %o %u"), out);
    }

    #[test]
    fn test_enable_xfer_command_comments_out_other_active_command() {
        let content = "[options]\nXferCommand = /usr/bin/curl -o %o %u\n";
        let out = enable_xfer_command(content, "/usr/bin/wget -O %o %u");
        assert_eq!(
            out,
            "[options]\nXferCommand = /usr/bin/wget -O %o %u\n#XferCommand = /usr/bin/curl -o %o %u\n"
        );
    }
}
