/// Command-safety predicate for shell dispatch.
///
/// A command is safe to run without review only when it parses cleanly,
/// its executable is on the allow-list, and it carries none of the shell
/// metacharacters that change control flow or touch the filesystem in
/// ways static analysis cannot see.

/// Commands that may run without review when no dangerous flags are present.
const ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "echo", "pwd", "whoami", "date", "which", "head", "tail", "grep", "find", "wc",
    "sort", "uniq", "diff", "tree", "file", "stat", "git", "python", "python3", "node", "npm",
    "pip", "pip3", "docker", "curl", "wget", "jq", "sed", "awk", "cut", "tr", "basename",
    "dirname",
];

/// Metacharacters that force review regardless of the executable.
const DANGEROUS_METACHARACTERS: &[char] = &[
    ';', '|', '&', '>', '<', '`', '$', '(', ')', '{', '}', '[', ']', '*', '?', '~', '!', '^',
    '\n', '\r',
];

/// Split a command into its executable and arguments with POSIX word
/// splitting. Fails on empty input or unbalanced quoting.
pub fn parse_command(command: &str) -> Result<(String, Vec<String>), String> {
    if command.trim().is_empty() {
        return Err("Command cannot be empty".to_string());
    }
    let parts =
        shlex::split(command).ok_or_else(|| "Invalid command syntax".to_string())?;
    let mut iter = parts.into_iter();
    let Some(base) = iter.next() else {
        return Err("Command cannot be empty".to_string());
    };
    Ok((base, iter.collect()))
}

/// Whether `command` may execute without human review, with the reason.
pub fn check_command_safety(command: &str) -> (bool, String) {
    for ch in DANGEROUS_METACHARACTERS {
        if command.contains(*ch) {
            return (
                false,
                format!("Contains dangerous metacharacter: '{}'", ch.escape_default()),
            );
        }
    }

    let (base, args) = match parse_command(command) {
        Ok(parsed) => parsed,
        Err(reason) => return (false, reason),
    };

    if !ALLOWED_COMMANDS.contains(&base.as_str()) {
        return (false, format!("Command '{}' not in allowlist", base));
    }

    if base == "rm" && (command.contains("-rf") || command.contains("-fr")) {
        return (false, "Recursive force delete requires approval".to_string());
    }

    if base == "curl" || base == "wget" {
        for flag in ["-o", "--output", "-O", ">"] {
            if args.iter().any(|a| a == flag) {
                return (
                    false,
                    format!("Output redirection with {} requires approval", flag),
                );
            }
        }
    }

    (true, "Command is safe".to_string())
}
