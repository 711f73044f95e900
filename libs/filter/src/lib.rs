//! # fleet-filter
//!
//! Filter expressions for instance listings.
//!
//! ## Syntax
//!
//! A filter is a whitespace separated chain of conditions joined by logical
//! connectives:
//!
//! ```text
//! <field> <operator> <value> [(and|or) <field> <operator> <value>]...
//! ```
//!
//! - `name` compares against the instance name.
//! - `config.<key>` compares against the expanded configuration value for
//!   `<key>`. A missing key compares as the empty string.
//! - Any other field never matches.
//! - Operators are `eq` and `neq`.
//!
//! Conditions fold strictly left to right with no precedence: the result
//! starts as `true` and each condition is combined with the running result
//! using the connective that preceded it. Every condition is evaluated.
//!
//! ```
//! use std::borrow::Cow;
//! use fleet_filter::{FilterExpression, FilterTarget};
//!
//! struct Web;
//!
//! impl FilterTarget for Web {
//!     fn name(&self) -> &str {
//!         "web-1"
//!     }
//!
//!     fn config_value(&self, key: &str) -> Option<Cow<'_, str>> {
//!         (key == "user.tier").then_some(Cow::Borrowed("frontend"))
//!     }
//! }
//!
//! let expr: FilterExpression = "name eq web-1 and config.user.tier eq frontend".parse().unwrap();
//! assert!(expr.evaluate(&Web));
//! ```

mod error;
mod expr;

pub use error::FilterError;
pub use expr::{Connective, Field, FilterExpression, FilterTarget, Operator, Predicate};
