use std::collections::HashMap;

use garde::Validate;
use serde::Deserialize;

use crate::models::normalize_email;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Recipient {
    #[garde(email)]
    pub email: String,
    #[garde(skip)]
    pub name: Option<String>,
    #[garde(skip)]
    pub vars: HashMap<String, String>,
}

impl Recipient {
    /// Normalizes the email to lowercase/trimmed form and validates it
    /// syntactically. Invalid addresses are rejected here so they never
    /// reach the Scheduler.
    pub fn new(
        email: impl Into<String>,
        name: Option<String>,
        vars: HashMap<String, String>,
    ) -> Result<Self, garde::Report> {
        let recipient = Self {
            email: normalize_email(&email.into()),
            name,
            vars,
        };
        recipient.validate()?;
        Ok(recipient)
    }
}

/// External collaborator: something that yields validated recipients.
/// The concrete CSV/XLSX/JSON parsers are out of core scope; callers
/// implement this trait over whatever source they have (a file, a
/// database query, an in-memory `Vec`).
pub trait RecipientSource: Iterator<Item = Recipient> + Send {}

impl<T> RecipientSource for T where T: Iterator<Item = Recipient> + Send {}
