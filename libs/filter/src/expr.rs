//! Filter expression types, parsing and evaluation.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use crate::error::FilterError;

/// Prefix selecting a key of the expanded configuration.
const CONFIG_PREFIX: &str = "config.";

/// Something a filter can be evaluated against.
pub trait FilterTarget {
    /// The instance name.
    fn name(&self) -> &str;

    /// Look up a key in the expanded configuration.
    fn config_value(&self, key: &str) -> Option<Cow<'_, str>>;
}

impl<T: FilterTarget + ?Sized> FilterTarget for &T {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn config_value(&self, key: &str) -> Option<Cow<'_, str>> {
        (**self).config_value(key)
    }
}

/// The attribute a condition compares against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    /// The instance name.
    Name,
    /// A key of the expanded configuration (prefix already stripped).
    Config(String),
    /// Any other field. Never matches.
    Unknown(String),
}

impl Field {
    fn parse(token: &str) -> Self {
        if token == "name" {
            return Self::Name;
        }

        match token.strip_prefix(CONFIG_PREFIX) {
            Some(key) => Self::Config(key.to_string()),
            None => Self::Unknown(token.to_string()),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Name => write!(f, "name"),
            Field::Config(key) => write!(f, "{CONFIG_PREFIX}{key}"),
            Field::Unknown(raw) => write!(f, "{raw}"),
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Neq,
}

impl Operator {
    /// Everything that is not `neq` compares for equality.
    fn parse_lenient(token: &str) -> Self {
        if token == "neq" {
            Self::Neq
        } else {
            Self::Eq
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
        }
    }
}

impl FromStr for Operator {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Self::Eq),
            "neq" => Ok(Self::Neq),
            other => Err(FilterError::UnknownOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical connective joining a condition to the running result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connective {
    And,
    Or,
}

impl Connective {
    /// Everything that is not `and` is treated as `or`.
    fn parse_lenient(token: &str) -> Self {
        if token == "and" {
            Self::And
        } else {
            Self::Or
        }
    }

    fn combine(self, acc: bool, current: bool) -> bool {
        match self {
            Connective::And => acc && current,
            Connective::Or => acc || current,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Connective::And => "and",
            Connective::Or => "or",
        }
    }
}

impl FromStr for Connective {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            other => Err(FilterError::UnknownConnective(other.to_string())),
        }
    }
}

impl fmt::Display for Connective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `<field> <operator> <value>` condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Predicate {
    pub field: Field,
    pub operator: Operator,
    pub value: String,
}

impl Predicate {
    /// Evaluate this condition against a target.
    pub fn evaluate<T: FilterTarget + ?Sized>(&self, target: &T) -> bool {
        let equal = match &self.field {
            Field::Name => target.name() == self.value,
            Field::Config(key) => target.config_value(key).as_deref().unwrap_or("") == self.value,
            Field::Unknown(_) => return false,
        };

        match self.operator {
            Operator::Eq => equal,
            Operator::Neq => !equal,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

/// A parsed filter expression.
///
/// Each term carries the connective that preceded it; the first term always
/// carries [`Connective::And`] so it folds against the initial `true`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterExpression {
    terms: Vec<(Connective, Predicate)>,
}

impl FilterExpression {
    /// Parse a filter, rejecting unknown operators, unknown connectives and
    /// incomplete conditions.
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        Self::parse_tokens(input, false)
    }

    /// Parse a filter the tolerant way: any operator other than `neq` is
    /// equality, any connective other than `and` is `or`, and a trailing
    /// incomplete condition is dropped.
    pub fn parse_lenient(input: &str) -> Self {
        match Self::parse_tokens(input, true) {
            Ok(expr) => expr,
            // lenient parsing never reports errors
            Err(_) => Self { terms: Vec::new() },
        }
    }

    fn parse_tokens(input: &str, lenient: bool) -> Result<Self, FilterError> {
        let tokens: Vec<&str> = input.split_whitespace().collect();
        if tokens.is_empty() && !lenient {
            return Err(FilterError::Empty);
        }

        let mut terms = Vec::with_capacity(tokens.len() / 4 + 1);
        let mut connective = Connective::And;
        let mut index = 0;

        while index < tokens.len() {
            if index + 3 > tokens.len() {
                if lenient {
                    break;
                }
                return Err(FilterError::Incomplete { position: index });
            }

            let field = Field::parse(tokens[index]);
            let operator = if lenient {
                Operator::parse_lenient(tokens[index + 1])
            } else {
                tokens[index + 1].parse()?
            };
            let value = tokens[index + 2].to_string();
            terms.push((
                connective,
                Predicate {
                    field,
                    operator,
                    value,
                },
            ));
            index += 3;

            if index < tokens.len() {
                connective = if lenient {
                    Connective::parse_lenient(tokens[index])
                } else {
                    tokens[index].parse()?
                };
                index += 1;

                if index == tokens.len() && !lenient {
                    return Err(FilterError::Incomplete { position: index });
                }
            }
        }

        Ok(Self { terms })
    }

    /// Evaluate the expression against a target.
    ///
    /// Every condition is evaluated, whatever the running result is.
    pub fn evaluate<T: FilterTarget + ?Sized>(&self, target: &T) -> bool {
        self.terms
            .iter()
            .fold(true, |acc, (connective, predicate)| {
                let current = predicate.evaluate(target);
                connective.combine(acc, current)
            })
    }

    /// The parsed conditions with their preceding connectives.
    pub fn terms(&self) -> &[(Connective, Predicate)] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl FromStr for FilterExpression {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (connective, predicate)) in self.terms.iter().enumerate() {
            if index > 0 {
                write!(f, " {connective} ")?;
            }
            write!(f, "{predicate}")?;
        }
        Ok(())
    }
}
