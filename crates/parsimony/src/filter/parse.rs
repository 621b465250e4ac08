//! Filter construction from short names and from one-line expressions
use super::*;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("unknown filter `{0}`")]
    UnknownFilter(String),
    #[error("please select a comparator for `{filter}` (got `{token}`)")]
    MissingComparator { filter: String, token: String },
    #[error("{reason} for `{filter}` (got `{value}`)")]
    InvalidValue {
        filter: String,
        value: String,
        reason: String,
    },
    #[error("too few parameters in filter `{0}`")]
    MalformedExpression(String),
}

/// Every expression that failed to parse, together with the reason
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Default)]
#[error("{} invalid filter(s): {}", .0.len(), format_errors(.0))]
pub struct FilterErrors(pub Vec<(String, FilterError)>);

fn format_errors(errors: &[(String, FilterError)]) -> String {
    errors
        .iter()
        .map(|(expr, err)| format!("[{}] {}", expr, err))
        .collect::<Vec<_>>()
        .join("; ")
}

fn take_while<'s, F: Fn(char) -> bool>(input: &'s str, pred: F) -> (&'s str, &'s str) {
    let end = input
        .char_indices()
        .find(|&(_, c)| !pred(c))
        .map(|(ix, _)| ix)
        .unwrap_or(input.len());
    (&input[..end], &input[end..])
}

#[inline]
fn take_whitespace(input: &str) -> &str {
    input.trim_start_matches(char::is_whitespace)
}

#[inline]
fn take_word(input: &str) -> (&str, &str) {
    take_while(take_whitespace(input), |ch| !ch.is_whitespace())
}

/// Comparators accepted by the filter with this short name. Unknown filters
/// accept none.
pub fn available_comparators(short_name: &str) -> &'static [Comparator] {
    FilterKind::resolve(short_name).map_or(&[], |kind| kind.value_type().comparators())
}

fn invalid(kind: &FilterKind, raw: &str, reason: impl Into<String>) -> FilterError {
    FilterError::InvalidValue {
        filter: kind.short_name().into_owned(),
        value: raw.to_string(),
        reason: reason.into(),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_value(
    kind: &FilterKind,
    comparator: Comparator,
    raw: &str,
) -> Result<(FilterValue, Option<Regex>), FilterError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(invalid(kind, raw, "please enter a value"));
    }
    match kind.value_type() {
        ValueType::Numerical => raw
            .parse::<f64>()
            .ok()
            .filter(|n| !n.is_nan())
            .map(|n| (FilterValue::Number(n), None))
            .ok_or_else(|| invalid(kind, raw, "please enter a numerical value")),
        ValueType::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok((FilterValue::Bool(true), None)),
            "false" => Ok((FilterValue::Bool(false), None)),
            _ => Err(invalid(kind, raw, "please enter true or false")),
        },
        ValueType::Literal | ValueType::LiteralList => match comparator {
            Comparator::In => Ok((FilterValue::List(split_list(raw)), None)),
            Comparator::Regex => {
                let re = Regex::new(raw).map_err(|e| invalid(kind, raw, e.to_string()))?;
                Ok((FilterValue::Literal(raw.to_string()), Some(re)))
            }
            _ => Ok((FilterValue::Literal(raw.to_string()), None)),
        },
        ValueType::Modification => raw
            .parse::<ModificationDescriptor>()
            .map(|m| (FilterValue::Modification(m), None))
            .map_err(|_| invalid(kind, raw, "please enter a modification")),
    }
}

/// Build a filter from its short name, a comparator token, the raw value
/// and the negation flag
pub fn build_filter(
    short_name: &str,
    comparator: &str,
    raw: &str,
    negate: bool,
) -> Result<Filter, FilterError> {
    let kind = FilterKind::resolve(short_name)
        .ok_or_else(|| FilterError::UnknownFilter(short_name.to_string()))?;

    let comparator = comparator
        .parse::<Comparator>()
        .ok()
        .filter(|c| kind.value_type().comparators().contains(c))
        .ok_or_else(|| FilterError::MissingComparator {
            filter: short_name.to_string(),
            token: comparator.to_string(),
        })?;

    let (value, regex) = parse_value(&kind, comparator, raw)?;
    Ok(Filter {
        kind,
        comparator,
        value,
        negate,
        regex,
    })
}

/// Parse `<short_name> [not|!]<comparator> <value>`. The value is the rest
/// of the line. Negation may also be written as a leading `!` on the short
/// name, or a leading `not` word.
pub fn parse_filter_expression(input: &str) -> Result<Filter, FilterError> {
    let malformed = || FilterError::MalformedExpression(input.trim().to_string());
    let mut negate = false;

    let (mut name, mut rest) = take_word(input);
    if name == "not" {
        negate = true;
        (name, rest) = take_word(rest);
    }
    if let Some(stripped) = name.strip_prefix('!') {
        negate = true;
        name = stripped;
    }

    let (mut cmp, mut rest) = take_word(rest);
    if cmp == "not" {
        negate = true;
        (cmp, rest) = take_word(rest);
    } else if cmp != "!=" {
        if let Some(stripped) = cmp.strip_prefix('!') {
            negate = true;
            cmp = stripped;
        }
    }

    let value = rest.trim();
    if name.is_empty() || cmp.is_empty() || value.is_empty() {
        return Err(malformed());
    }
    build_filter(name, cmp, value, negate)
}

/// Parse every expression, collecting all failures rather than stopping at
/// the first one
pub fn build_filters<S: AsRef<str>>(expressions: &[S]) -> Result<Vec<Filter>, FilterErrors> {
    let mut filters = Vec::with_capacity(expressions.len());
    let mut errors = Vec::new();
    for expr in expressions {
        let expr = expr.as_ref();
        match parse_filter_expression(expr) {
            Ok(filter) => filters.push(filter),
            Err(err) => {
                log::error!("invalid filter `{}`: {}", expr, err);
                errors.push((expr.to_string(), err));
            }
        }
    }
    if errors.is_empty() {
        Ok(filters)
    } else {
        Err(FilterErrors(errors))
    }
}
