//! Habit-tracker authentication library
//!
//! Provides the credential pair storage and the token endpoint exchanges
//! (login and refresh) for the habit-tracker API client. This crate is a
//! standalone library with no dependency on the request pipeline — it can
//! be tested and used independently.
//!
//! Credential flow:
//! 1. Host calls `token::login()` with the user's email and password
//! 2. Credential stored via `credential::CredentialStore::set()`
//! 3. Request pipeline reads the access token before every dispatch
//! 4. On authorization failure the refresh leader calls `token::refresh_token()`
//! 5. Replacement pair saved via `credential::CredentialStore::set()`
//! 6. Session teardown clears the pair via `credential::CredentialStore::clear()`

pub mod credential;
pub mod error;
pub mod token;

pub use credential::{Credential, CredentialStore};
pub use error::{Error, Result};
pub use token::{LOGIN_PATH, REFRESH_PATH, TokenResponse, login, refresh_token};
