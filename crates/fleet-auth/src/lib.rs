//! Operator authentication for the panel dashboard API

pub mod jwt;
pub mod password;

pub use jwt::{JwtError, JwtValidator, OperatorClaims};
pub use password::{hash_password, verify_password, AdminCredentials, PasswordError};
