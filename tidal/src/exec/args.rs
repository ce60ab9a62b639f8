//! Argument validation for external tool invocations.
//!
//! Tools are always spawned from an argument vector, never through a shell.
//! The denylist below additionally rejects tokens that would only make sense
//! to a shell, which catches arguments assembled from untrusted strings.

use std::ffi::OsStr;

use crate::{Error, Result};

/// Characters rejected anywhere in an argument.
pub const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '<', '>'];

/// Validate every token and return them as owned UTF-8 strings.
///
/// Fails with [`Error::Security`] when a token is not valid UTF-8 or
/// contains a shell metacharacter.
pub fn validate_arguments<I, S>(args: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    args.into_iter()
        .map(|arg| {
            let arg = arg.as_ref();
            let arg = arg.to_str().ok_or_else(|| {
                Error::security(format!("argument is not a valid string: {arg:?}"))
            })?;
            if let Some(c) = arg.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
                return Err(Error::security(format!(
                    "potentially dangerous character '{c}' in argument: {arg}"
                )));
            }
            Ok(arg.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_valid_arguments_pass_through() {
        let args = ["-y", "-i", "/tmp/in put.mp4", "-vf", "scale=1280:720", "out.mkv"];
        let validated = validate_arguments(args).unwrap();
        assert_eq!(validated, args);
    }

    #[test]
    fn test_empty_argument_list_is_valid() {
        let empty: [&str; 0] = [];
        assert!(validate_arguments(empty).unwrap().is_empty());
    }

    #[rstest]
    #[case("input.mp4; rm -rf /")]
    #[case("a && b")]
    #[case("a | b")]
    #[case("`whoami`")]
    #[case("$HOME")]
    #[case("$(id)")]
    #[case("file)")]
    #[case("< /etc/passwd")]
    #[case("> out")]
    fn test_shell_metacharacters_rejected(#[case] arg: &str) {
        let err = validate_arguments(["-i", arg]).unwrap_err();
        assert!(matches!(err, Error::Security(_)), "{arg} should be rejected");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_argument_rejected() {
        use std::os::unix::ffi::OsStrExt;

        let bad = OsStr::from_bytes(&[0x66, 0x6f, 0xff]);
        let err = validate_arguments([OsStr::new("-i"), bad]).unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }
}
