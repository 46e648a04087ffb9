//! Input rules for credentials: username and email shape, and the password
//! checks applied on sign-up, password change and password reset.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;

pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MAX_USERNAME_LENGTH: usize = 150;
const MAX_SIMILARITY: f64 = 0.7;

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    static ref USERNAME_RE: Regex = Regex::new(r"^[\w.@+-]+$").unwrap();
    static ref NON_WORD_RE: Regex = Regex::new(r"\W+").unwrap();
    static ref COMMON_PASSWORDS: HashSet<&'static str> = include_str!("common_passwords.txt")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
}

pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 254 && EMAIL_RE.is_match(email)
}

pub fn validate_username(username: &str) -> Result<(), String> {
    if username.is_empty() {
        return Err("This field may not be blank.".into());
    }
    if username.chars().count() > MAX_USERNAME_LENGTH {
        return Err(format!(
            "Ensure this field has no more than {MAX_USERNAME_LENGTH} characters."
        ));
    }
    if !USERNAME_RE.is_match(username) {
        return Err("Enter a valid username. This value may contain only letters, \
                    numbers, and @/./+/-/_ characters."
            .into());
    }
    Ok(())
}

/// Runs every password check and returns all failures, in a stable order.
/// `username` and `email` feed the similarity check.
pub fn validate_password(password: &str, username: &str, email: &str) -> Vec<String> {
    let mut errors = Vec::new();
    let lowered = password.to_lowercase();

    for (value, name) in [(username, "username"), (email, "email address")] {
        if is_too_similar(&lowered, value) {
            errors.push(format!("The password is too similar to the {name}."));
            break;
        }
    }
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        errors.push(format!(
            "This password is too short. It must contain at least {MIN_PASSWORD_LENGTH} characters."
        ));
    }
    if COMMON_PASSWORDS.contains(lowered.trim()) {
        errors.push("This password is too common.".into());
    }
    if !password.is_empty() && password.chars().all(|c| c.is_ascii_digit()) {
        errors.push("This password is entirely numeric.".into());
    }
    errors
}

fn is_too_similar(password_lower: &str, attribute: &str) -> bool {
    if attribute.is_empty() {
        return false;
    }
    let attribute = attribute.to_lowercase();
    NON_WORD_RE
        .split(&attribute)
        .chain(std::iter::once(attribute.as_str()))
        .filter(|part| !part.is_empty())
        .any(|part| similarity(password_lower, part) >= MAX_SIMILARITY)
}

/// `2 * lcs / (len(a) + len(b))`, 1.0 for identical strings.
fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            cur[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(cur[j])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    2.0 * prev[b.len()] as f64 / total as f64
}
