use std::collections::BTreeMap;
use std::path::Path;

use crate::evaluator::EnvironmentDescriptor;

/// Variables whose value is a `:`-separated search path prepended to the
/// caller's existing value.
const SEARCH_PATH_KEYS: &[&str] = &["PATH", "MANPATH"];

/// Shell type for environment generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Zsh,
    Bash,
    Fish,
}

impl Shell {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "zsh" => Some(Shell::Zsh),
            "bash" => Some(Shell::Bash),
            "fish" => Some(Shell::Fish),
            _ => None,
        }
    }

    /// Shell named by a path such as the `$SHELL` value.
    pub fn from_path(path: &str) -> Option<Self> {
        Path::new(path)
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::from_name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Shell::Zsh => "zsh",
            Shell::Bash => "bash",
            Shell::Fish => "fish",
        }
    }
}

/// Activation variables ready to be rendered for a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn from_descriptor(descriptor: &EnvironmentDescriptor) -> Self {
        Self {
            vars: descriptor.activation.clone(),
        }
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Format the environment for the given shell
    pub fn format_for_shell(&self, shell: Shell) -> String {
        let lines: Vec<String> = self
            .vars
            .iter()
            .map(|(key, value)| {
                let search_path = SEARCH_PATH_KEYS.contains(&key.as_str());
                match shell {
                    Shell::Zsh | Shell::Bash => format_posix(key, value, search_path),
                    Shell::Fish => format_fish(key, value, search_path),
                }
            })
            .collect();
        lines.join("\n")
    }
}

fn format_posix(key: &str, value: &str, search_path: bool) -> String {
    if search_path {
        // `${VAR:+:$VAR}` avoids a trailing `:` when the variable is unset.
        format!(
            "export {key}=\"{}${{{key}:+:${key}}}\"",
            escape_double_quoted(value)
        )
    } else {
        format!("export {key}={}", quote_single(value))
    }
}

fn format_fish(key: &str, value: &str, search_path: bool) -> String {
    if search_path {
        let dirs: Vec<String> = value.split(':').map(quote_fish).collect();
        format!("set -gx {key} {} ${key}", dirs.join(" "))
    } else {
        format!("set -gx {key} {}", quote_fish(value))
    }
}

fn escape_double_quoted(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '"' | '\\' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn quote_single(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn quote_fish(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformId;

    fn environment() -> Environment {
        let descriptor = EnvironmentDescriptor {
            platform: PlatformId::parse("x86_64-linux").unwrap(),
            packages: Vec::new(),
            activation: BTreeMap::from([
                ("PATH".to_string(), "/store/a-rg-14/bin:/store/b-fd-9/bin".to_string()),
                ("MANPATH".to_string(), "/store/a-rg-14/share/man".to_string()),
                ("DEVSHELL_PACKAGES".to_string(), "rg fd".to_string()),
                ("GREETING".to_string(), "it's $HOME".to_string()),
            ]),
        };
        Environment::from_descriptor(&descriptor)
    }

    #[test]
    fn test_format_zsh() {
        let output = environment().format_for_shell(Shell::Zsh);

        assert!(output.contains(
            "export PATH=\"/store/a-rg-14/bin:/store/b-fd-9/bin${PATH:+:$PATH}\""
        ));
        assert!(output.contains("export MANPATH=\"/store/a-rg-14/share/man${MANPATH:+:$MANPATH}\""));
        assert!(output.contains("export DEVSHELL_PACKAGES='rg fd'"));
        assert!(output.contains("export GREETING='it'\\''s $HOME'"));
    }

    #[test]
    fn test_format_bash_matches_zsh() {
        let env = environment();
        assert_eq!(env.format_for_shell(Shell::Bash), env.format_for_shell(Shell::Zsh));
    }

    #[test]
    fn test_format_fish() {
        let output = environment().format_for_shell(Shell::Fish);

        assert!(output.contains("set -gx PATH '/store/a-rg-14/bin' '/store/b-fd-9/bin' $PATH"));
        assert!(output.contains("set -gx MANPATH '/store/a-rg-14/share/man' $MANPATH"));
        assert!(output.contains("set -gx GREETING 'it\\'s $HOME'"));
        assert!(!output.contains("export"));
    }

    #[test]
    fn test_output_is_sorted_by_key() {
        let output = environment().format_for_shell(Shell::Bash);
        let keys: Vec<&str> = output
            .lines()
            .map(|line| {
                line.trim_start_matches("export ")
                    .split('=')
                    .next()
                    .unwrap()
            })
            .collect();
        assert_eq!(keys, vec!["DEVSHELL_PACKAGES", "GREETING", "MANPATH", "PATH"]);
    }

    #[test]
    fn test_double_quote_escaping() {
        assert_eq!(escape_double_quoted("a\"b$c`d\\"), "a\\\"b\\$c\\`d\\\\");
    }

    #[test]
    fn test_shell_from_name() {
        assert_eq!(Shell::from_name("zsh"), Some(Shell::Zsh));
        assert_eq!(Shell::from_name("BASH"), Some(Shell::Bash));
        assert_eq!(Shell::from_name("Fish"), Some(Shell::Fish));
        assert_eq!(Shell::from_name("powershell"), None);
    }

    #[test]
    fn test_shell_from_path() {
        assert_eq!(Shell::from_path("/usr/bin/fish"), Some(Shell::Fish));
        assert_eq!(Shell::from_path("/bin/zsh"), Some(Shell::Zsh));
        assert_eq!(Shell::from_path("/bin/tcsh"), None);
    }
}
