//! Command-line composition.
//!
//! Windows does not pass distinct argument vectors to a new process; the
//! whole command line travels as a single string and the target application
//! re-splits it. Joining with spaces is not enough because arguments may
//! contain whitespace, quotes, and trailing backslashes, so quoting follows
//! the `CommandLineToArgvW` rules.

/// Quotes and joins an argument list into a single command-line fragment.
pub(crate) fn join_args<T: AsRef<str>>(args: &[T]) -> String {
    let mut out = String::new();
    for arg in args {
        if !out.is_empty() {
            out.push(' ');
        }
        append_arg(&mut out, arg.as_ref());
    }
    out
}

/// Composes the full command line for a launch: the quoted program path
/// followed by the joined arguments.
pub(crate) fn compose(program: &str, args: &[String]) -> String {
    let mut out = String::new();
    append_arg(&mut out, program);
    for arg in args {
        out.push(' ');
        append_arg(&mut out, arg);
    }
    out
}

fn append_arg(out: &mut String, arg: &str) {
    // Empty arguments and arguments containing whitespace must be quoted so
    // the target's splitter sees them as one unit.
    let quote = arg.is_empty() || arg.contains(' ') || arg.contains('\t');
    if quote {
        out.push('"');
    }

    // A literal quote needs a backslash, and any run of backslashes directly
    // before it (or before the closing quote we add) must be doubled.
    let mut backslashes = 0usize;
    for ch in arg.chars() {
        if ch == '\\' {
            backslashes += 1;
        } else {
            if ch == '"' {
                for _ in 0..=backslashes {
                    out.push('\\');
                }
            }
            backslashes = 0;
        }
        out.push(ch);
    }

    if quote {
        for _ in 0..backslashes {
            out.push('\\');
        }
        out.push('"');
    }
}
