use std::path::Path;

use wsrun_bash_runner::join_quoted;

/// Build the shell command line for a script: the resolved path followed by
/// each argument, every word single-quoted.
pub fn build_invocation(script: &Path, args: &[String]) -> String {
    let script = script.to_string_lossy();
    join_quoted(std::iter::once(script.as_ref()).chain(args.iter().map(String::as_str)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_every_segment() {
        let invocation = build_invocation(
            Path::new("/ws/.wsrun/scripts/run me"),
            &["a b".to_string(), "it's".to_string(), "$(id)".to_string()],
        );
        assert_eq!(
            invocation,
            "'/ws/.wsrun/scripts/run me' 'a b' 'it'\\''s' '$(id)'"
        );
    }

    #[test]
    fn no_args_is_just_the_script() {
        assert_eq!(build_invocation(Path::new("/x/y"), &[]), "'/x/y'");
    }
}
