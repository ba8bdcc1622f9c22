//! Password policy validation.
//!
//! Composition rules (length, character classes) plus guessability rules:
//! banned substrings, three-character runs taken from keyboard rows, the
//! alphabet or the digits (in either direction), and four or more identical
//! characters in a row.

use serde::Deserialize;

/// Passwords containing any of these (case-insensitive) are rejected.
pub const BANNED_PATTERNS: &[&str] = &[
    "password", "passw0rd", "letmein", "welcome", "admin", "qwerty", "iloveyou", "monkey",
    "dragon", "football", "baseball", "sunshine", "princess", "master", "login", "secret",
    "trustno1", "changeme",
];

const SEQUENCES: &[&str] = &[
    "abcdefghijklmnopqrstuvwxyz",
    "0123456789",
    "qwertyuiop",
    "asdfghjkl",
    "zxcvbnm",
    "1234567890",
];

const SEQUENCE_RUN: usize = 3;
const REPEAT_RUN: usize = 4;

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_number: bool,
    pub require_special: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            require_uppercase: true,
            require_lowercase: true,
            require_number: true,
            require_special: true,
        }
    }
}

/// Errors related to password policy validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    PasswordTooShort { min_length: usize, actual_length: usize },
    PasswordMissingUppercase,
    PasswordMissingLowercase,
    PasswordMissingNumber,
    PasswordMissingSpecial,
    /// Contains a commonly guessed word.
    BannedPattern(String),
    /// Contains a run like "abc", "321" or "qwe".
    SequentialRun(String),
    /// Same character four or more times in a row.
    RepeatedCharacters(char),
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::PasswordTooShort {
                min_length,
                actual_length,
            } => {
                write!(
                    f,
                    "Password must be at least {} characters (got {})",
                    min_length, actual_length
                )
            }
            PolicyError::PasswordMissingUppercase => {
                write!(f, "Password must contain at least one uppercase letter")
            }
            PolicyError::PasswordMissingLowercase => {
                write!(f, "Password must contain at least one lowercase letter")
            }
            PolicyError::PasswordMissingNumber => {
                write!(f, "Password must contain at least one number")
            }
            PolicyError::PasswordMissingSpecial => {
                write!(f, "Password must contain at least one special character")
            }
            PolicyError::BannedPattern(pattern) => {
                write!(f, "Password must not contain common words like '{}'", pattern)
            }
            PolicyError::SequentialRun(run) => {
                write!(f, "Password must not contain sequences like '{}'", run)
            }
            PolicyError::RepeatedCharacters(c) => {
                write!(
                    f,
                    "Password must not repeat '{}' four or more times in a row",
                    c
                )
            }
        }
    }
}

impl std::error::Error for PolicyError {}

/// Password policy validation service.
#[derive(Debug, Clone)]
pub struct PolicyService;

impl PolicyService {
    /// Returns the first violation found.
    pub fn validate_password(password: &str, policy: &PasswordPolicy) -> Result<(), PolicyError> {
        match Self::validate_password_all(password, policy).into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Validate all password requirements and return all violations.
    pub fn validate_password_all(password: &str, policy: &PasswordPolicy) -> Vec<PolicyError> {
        let mut errors = Vec::new();
        let length = password.chars().count();

        if length < policy.min_length {
            errors.push(PolicyError::PasswordTooShort {
                min_length: policy.min_length,
                actual_length: length,
            });
        }

        if policy.require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            errors.push(PolicyError::PasswordMissingUppercase);
        }

        if policy.require_lowercase && !password.chars().any(|c| c.is_lowercase()) {
            errors.push(PolicyError::PasswordMissingLowercase);
        }

        if policy.require_number && !password.chars().any(|c| c.is_ascii_digit()) {
            errors.push(PolicyError::PasswordMissingNumber);
        }

        if policy.require_special && !password.chars().any(is_special) {
            errors.push(PolicyError::PasswordMissingSpecial);
        }

        let lowered = password.to_lowercase();

        if let Some(pattern) = BANNED_PATTERNS.iter().find(|p| lowered.contains(*p)) {
            errors.push(PolicyError::BannedPattern(pattern.to_string()));
        }

        if let Some(run) = find_sequential_run(&lowered) {
            errors.push(PolicyError::SequentialRun(run));
        }

        if let Some(c) = find_repeated_run(password) {
            errors.push(PolicyError::RepeatedCharacters(c));
        }

        errors
    }
}

fn is_special(c: char) -> bool {
    c.is_ascii_punctuation() || (!c.is_alphanumeric() && !c.is_whitespace())
}

fn find_sequential_run(lowered: &str) -> Option<String> {
    let chars: Vec<char> = lowered.chars().collect();

    chars.windows(SEQUENCE_RUN).find_map(|window| {
        let run: String = window.iter().collect();
        let reversed: String = window.iter().rev().collect();
        SEQUENCES
            .iter()
            .any(|seq| seq.contains(&run) || seq.contains(&reversed))
            .then_some(run)
    })
}

fn find_repeated_run(password: &str) -> Option<char> {
    let chars: Vec<char> = password.chars().collect();

    chars
        .windows(REPEAT_RUN)
        .find(|window| window.iter().all(|c| *c == window[0]))
        .map(|window| window[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PasswordPolicy {
        PasswordPolicy::default()
    }

    #[test]
    fn test_strong_passwords_pass() {
        for password in ["Tr4il!Mix9Zp", "Nq8$Wolf#Rain7", "Gl4cier&Moss2"] {
            assert_eq!(
                PolicyService::validate_password(password, &policy()),
                Ok(()),
                "{password} should pass"
            );
        }
    }

    #[test]
    fn test_banned_pattern_rejected() {
        let errors = PolicyService::validate_password_all("Password123!", &policy());
        assert!(errors.contains(&PolicyError::BannedPattern("password".into())));
    }

    #[test]
    fn test_alphabet_run_rejected_both_directions() {
        assert_eq!(
            PolicyService::validate_password("Xk!abc9Qz", &policy()),
            Err(PolicyError::SequentialRun("abc".into()))
        );
        assert_eq!(
            PolicyService::validate_password("Rq!cba7Lm", &policy()),
            Err(PolicyError::SequentialRun("cba".into()))
        );
    }

    #[test]
    fn test_keyboard_and_digit_runs_rejected() {
        assert_eq!(
            PolicyService::validate_password("Zq!qwe7Lm", &policy()),
            Err(PolicyError::SequentialRun("qwe".into()))
        );
        assert_eq!(
            PolicyService::validate_password("Mk!987Lpq", &policy()),
            Err(PolicyError::SequentialRun("987".into()))
        );
    }

    #[test]
    fn test_repeated_characters_rejected() {
        assert_eq!(
            PolicyService::validate_password("Zq9!xxxxLm", &policy()),
            Err(PolicyError::RepeatedCharacters('x'))
        );
        assert!(PolicyService::validate_password("Zq9!xxxLm#", &policy()).is_ok());
    }

    #[test]
    fn test_composition_rules() {
        let errors = PolicyService::validate_password_all("short", &policy());
        assert!(errors.contains(&PolicyError::PasswordTooShort {
            min_length: 8,
            actual_length: 5
        }));
        assert!(errors.contains(&PolicyError::PasswordMissingUppercase));
        assert!(errors.contains(&PolicyError::PasswordMissingNumber));
        assert!(errors.contains(&PolicyError::PasswordMissingSpecial));
    }

    #[test]
    fn test_messages_are_displayable() {
        let err = PolicyError::SequentialRun("abc".into());
        assert_eq!(
            err.to_string(),
            "Password must not contain sequences like 'abc'"
        );
    }
}
