//! Pest-based parser for observation patterns

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;

use crate::ast::*;

#[derive(Parser)]
#[grammar = "pattern.pest"]
pub struct PatternParser;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Pest error: {0}")]
    Pest(#[from] Box<pest::error::Error<Rule>>),
}

/// Parse pattern text into its AST
pub fn parse(source: &str) -> Result<PatternExpr, ParseError> {
    let mut pairs = PatternParser::parse(Rule::pattern, source).map_err(Box::new)?;
    let pattern = pairs
        .next()
        .ok_or_else(|| ParseError::Syntax("Empty input".to_string()))?;

    let observation = pattern
        .into_inner()
        .find(|p| p.as_rule() == Rule::observation)
        .ok_or_else(|| ParseError::Syntax("Missing observation".to_string()))?;

    let body = first_inner(observation)?;
    parse_or(body)
}

fn first_inner(pair: Pair<Rule>) -> Result<Pair<Rule>, ParseError> {
    let rule = pair.as_rule();
    pair.into_inner()
        .next()
        .ok_or_else(|| ParseError::Syntax(format!("Empty {:?}", rule)))
}

fn parse_or(pair: Pair<Rule>) -> Result<PatternExpr, ParseError> {
    let mut terms = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::and_expr)
        .map(parse_and)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(if terms.len() == 1 {
        terms.remove(0)
    } else {
        PatternExpr::Or(terms)
    })
}

fn parse_and(pair: Pair<Rule>) -> Result<PatternExpr, ParseError> {
    let mut terms = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::primary)
        .map(parse_primary)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(if terms.len() == 1 {
        terms.remove(0)
    } else {
        PatternExpr::And(terms)
    })
}

fn parse_primary(pair: Pair<Rule>) -> Result<PatternExpr, ParseError> {
    let inner = first_inner(pair)?;
    match inner.as_rule() {
        Rule::or_expr => parse_or(inner),
        Rule::comparison => parse_comparison(inner).map(PatternExpr::Comparison),
        other => Err(ParseError::Syntax(format!("Unexpected {:?}", other))),
    }
}

fn parse_comparison(pair: Pair<Rule>) -> Result<Comparison, ParseError> {
    let mut path = None;
    let mut negated = false;
    let mut test = None;

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::object_path => path = Some(parse_path(part)?),
            Rule::not_kw => negated = true,
            Rule::test => test = Some(parse_test(first_inner(part)?)?),
            _ => {}
        }
    }

    Ok(Comparison {
        path: path.ok_or_else(|| ParseError::Syntax("Missing object path".to_string()))?,
        negated,
        test: test.ok_or_else(|| ParseError::Syntax("Missing comparison".to_string()))?,
    })
}

fn parse_path(pair: Pair<Rule>) -> Result<ObjectPath, ParseError> {
    let mut inner = pair.into_inner();
    let kind = inner
        .next()
        .ok_or_else(|| ParseError::Syntax("Missing kind".to_string()))?;
    let property = inner
        .next()
        .ok_or_else(|| ParseError::Syntax("Missing property".to_string()))?;

    Ok(ObjectPath {
        kind: kind.as_str().to_string(),
        property: property.as_str().to_string(),
    })
}

fn parse_test(pair: Pair<Rule>) -> Result<Test, ParseError> {
    match pair.as_rule() {
        Rule::set_test => {
            let items = pair
                .into_inner()
                .filter(|p| p.as_rule() == Rule::literal)
                .map(parse_literal)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Test::In(items))
        }
        Rule::like_test => Ok(Test::Like(string_of(pair)?)),
        Rule::match_test => Ok(Test::Matches(string_of(pair)?)),
        Rule::cmp_test => {
            let mut inner = pair.into_inner();
            let op = inner
                .next()
                .ok_or_else(|| ParseError::Syntax("Missing operator".to_string()))?;
            let value = inner
                .next()
                .ok_or_else(|| ParseError::Syntax("Missing value".to_string()))?;

            let comparator = match op.as_str() {
                "=" => Comparator::Eq,
                "!=" => Comparator::Ne,
                "<" => Comparator::Lt,
                "<=" => Comparator::Le,
                ">" => Comparator::Gt,
                ">=" => Comparator::Ge,
                other => return Err(ParseError::Syntax(format!("Unknown operator: {}", other))),
            };
            Ok(Test::Compare(comparator, parse_literal(value)?))
        }
        other => Err(ParseError::Syntax(format!("Unexpected {:?}", other))),
    }
}

fn string_of(pair: Pair<Rule>) -> Result<String, ParseError> {
    let string = pair
        .into_inner()
        .find(|p| p.as_rule() == Rule::string)
        .ok_or_else(|| ParseError::Syntax("Missing string".to_string()))?;
    Ok(unescape(first_inner(string)?.as_str()))
}

fn unescape(raw: &str) -> String {
    raw.replace("\\'", "'").replace("\\\\", "\\")
}

fn parse_literal(pair: Pair<Rule>) -> Result<Literal, ParseError> {
    let inner = first_inner(pair)?;
    let text = inner.as_str();
    match inner.as_rule() {
        Rule::string => Ok(Literal::String(unescape(first_inner(inner)?.as_str()))),
        Rule::int => text
            .parse()
            .map(Literal::Int)
            .map_err(|_| ParseError::Syntax(format!("Integer out of range: {}", text))),
        Rule::float => text
            .parse()
            .map(Literal::Float)
            .map_err(|_| ParseError::Syntax(format!("Invalid number: {}", text))),
        Rule::boolean => Ok(Literal::Bool(text.eq_ignore_ascii_case("true"))),
        other => Err(ParseError::Syntax(format!("Invalid literal: {:?}", other))),
    }
}
