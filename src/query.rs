//! Query normalization and the boolean expression parser.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or      := and ("OR" and)*
//! and     := unary (["AND"] unary)*
//! unary   := "NOT" unary | primary
//! primary := TERM | "\"" PHRASE "\"" | "(" or ")"
//! ```
//!
//! Operators are matched case-insensitively. Two operands with nothing
//! between them are joined by an implicit `AND`.

use serde::{Deserialize, Serialize};

/// A parsed boolean query. Terms and phrases are lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoolExpr {
    Term(String),
    Phrase(Vec<String>),
    And(Vec<BoolExpr>),
    Or(Vec<BoolExpr>),
    Not(Box<BoolExpr>),
}

impl BoolExpr {
    /// Terms that contribute positively to a match, in query order.
    pub fn positive_terms(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_terms(false, &mut out);
        out
    }

    /// Terms negated at the top level of a conjunction.
    ///
    /// `a AND NOT b` yields `b`; `a OR NOT b` yields nothing because the
    /// negation does not exclude documents on its own.
    pub fn excluded_terms(&self) -> Vec<String> {
        let mut out = Vec::new();
        let clauses: &[BoolExpr] = match self {
            BoolExpr::And(children) => children,
            other => std::slice::from_ref(other),
        };
        for clause in clauses {
            if let BoolExpr::Not(inner) = clause {
                match inner.as_ref() {
                    BoolExpr::Term(t) => out.push(t.clone()),
                    BoolExpr::Or(children) => {
                        for child in children {
                            if let BoolExpr::Term(t) = child {
                                out.push(t.clone());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        out
    }

    fn collect_terms(&self, negated: bool, out: &mut Vec<String>) {
        match self {
            BoolExpr::Term(t) if !negated => push_unique(out, t),
            BoolExpr::Phrase(words) if !negated => {
                for w in words {
                    push_unique(out, w);
                }
            }
            BoolExpr::Term(_) | BoolExpr::Phrase(_) => {}
            BoolExpr::And(children) | BoolExpr::Or(children) => {
                for child in children {
                    child.collect_terms(negated, out);
                }
            }
            BoolExpr::Not(inner) => inner.collect_terms(!negated, out),
        }
    }
}

fn push_unique(out: &mut Vec<String>, term: &str) {
    if !out.iter().any(|t| t == term) {
        out.push(term.to_string());
    }
}

/// A malformed boolean expression. `position` is a character offset.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error,
)]
#[error("{message} at position {position}")]
pub struct QuerySyntaxError {
    pub message: String,
    pub position: usize,
}

impl QuerySyntaxError {
    fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Phrase(Vec<String>),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, QuerySyntaxError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push((Token::LParen, i));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, i));
                i += 1;
            }
            '"' => {
                let start = i;
                i += 1;
                let body_start = i;
                while i < chars.len() && chars[i] != '"' {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(QuerySyntaxError::new(
                        "unterminated phrase",
                        start,
                    ));
                }
                let body: String = chars[body_start..i].iter().collect();
                i += 1;
                let words: Vec<String> = body
                    .split_whitespace()
                    .map(|w| w.to_lowercase())
                    .collect();
                if words.is_empty() {
                    return Err(QuerySyntaxError::new("empty phrase", start));
                }
                tokens.push((Token::Phrase(words), start));
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '(' | ')' | '"')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    _ => Token::Word(word.to_lowercase()),
                };
                tokens.push((token, start));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, o)| *o).unwrap_or(self.end)
    }

    fn parse_or(&mut self) -> Result<BoolExpr, QuerySyntaxError> {
        let mut clauses = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            clauses.push(self.parse_and()?);
        }
        Ok(collapse(clauses, BoolExpr::Or))
    }

    fn parse_and(&mut self) -> Result<BoolExpr, QuerySyntaxError> {
        let mut clauses = vec![self.parse_unary()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    clauses.push(self.parse_unary()?);
                }
                Some(
                    Token::Word(_)
                    | Token::Phrase(_)
                    | Token::Not
                    | Token::LParen,
                ) => clauses.push(self.parse_unary()?),
                _ => break,
            }
        }
        Ok(collapse(clauses, BoolExpr::And))
    }

    fn parse_unary(&mut self) -> Result<BoolExpr, QuerySyntaxError> {
        if self.peek() == Some(&Token::Not) {
            let at = self.offset();
            self.pos += 1;
            if self.peek().is_none() {
                return Err(QuerySyntaxError::new("NOT missing operand", at));
            }
            return Ok(BoolExpr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<BoolExpr, QuerySyntaxError> {
        let at = self.offset();
        let Some((token, _)) = self.tokens.get(self.pos).cloned() else {
            return Err(QuerySyntaxError::new("expected a term", at));
        };
        self.pos += 1;
        match token {
            Token::Word(w) => Ok(BoolExpr::Term(w)),
            Token::Phrase(words) => Ok(BoolExpr::Phrase(words)),
            Token::LParen => {
                if self.peek() == Some(&Token::RParen) {
                    return Err(QuerySyntaxError::new("empty parentheses", at));
                }
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(QuerySyntaxError::new(
                        "mismatched parenthesis",
                        at,
                    ));
                }
                self.pos += 1;
                Ok(inner)
            }
            Token::RParen => {
                Err(QuerySyntaxError::new("mismatched parenthesis", at))
            }
            Token::And | Token::Or => Err(QuerySyntaxError::new(
                "operator missing left operand",
                at,
            )),
            Token::Not => Err(QuerySyntaxError::new("NOT missing operand", at)),
        }
    }
}

fn collapse(
    mut clauses: Vec<BoolExpr>,
    wrap: fn(Vec<BoolExpr>) -> BoolExpr,
) -> BoolExpr {
    if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        wrap(clauses)
    }
}

/// Parse a boolean query expression.
pub fn parse(input: &str) -> Result<BoolExpr, QuerySyntaxError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(QuerySyntaxError::new("empty expression", 0));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.chars().count(),
    };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        let at = parser.offset();
        let message = match parser.peek() {
            Some(Token::RParen) => "mismatched parenthesis",
            _ => "invalid expression",
        };
        return Err(QuerySyntaxError::new(message, at));
    }
    Ok(expr)
}

/// A validated query ready for dispatch to the strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuery {
    /// Trimmed input with collapsed whitespace, original casing kept.
    pub original: String,
    /// Lower-cased form of `original`, used for matching and cache keys.
    pub normalized: String,
    /// Positive terms for fuzzy matching, highlighting and suggestions.
    pub terms: Vec<String>,
    /// Terms whose presence excludes a document from every strategy.
    pub excluded: Vec<String>,
    /// Parsed boolean form, absent when parsing failed.
    pub expression: Option<BoolExpr>,
}

impl NormalizedQuery {
    /// Normalize `raw`. Returns `None` for blank input.
    ///
    /// The query is always parsed, so negations steer every strategy. A
    /// syntax error is returned alongside the query; the terms then fall
    /// back to the bare words and the non-boolean strategies still run.
    pub fn new(raw: &str) -> Option<(Self, Option<QuerySyntaxError>)> {
        let original = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if original.is_empty() {
            return None;
        }
        let normalized = original.to_lowercase();

        let (expression, syntax_error) = match parse(&original) {
            Ok(expr) => (Some(expr), None),
            Err(err) => (None, Some(err)),
        };

        let (terms, excluded) = match &expression {
            Some(expr) => (expr.positive_terms(), expr.excluded_terms()),
            None => (plain_terms(&normalized), Vec::new()),
        };

        let query = Self {
            original,
            normalized,
            terms,
            excluded,
            expression,
        };
        Some((query, syntax_error))
    }

    /// Query text handed to the embedder: the positive terms in order.
    pub fn semantic_text(&self) -> String {
        if self.terms.is_empty() {
            self.normalized.clone()
        } else {
            self.terms.join(" ")
        }
    }
}

/// Split a query into bare terms, dropping operators, punctuation and
/// the word right after a `not`.
fn plain_terms(normalized: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut negated = false;
    for word in normalized.split_whitespace() {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric());
        match word {
            "" | "and" | "or" => {}
            "not" => negated = true,
            _ if negated => negated = false,
            _ => push_unique(&mut terms, word),
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(t: &str) -> BoolExpr {
        BoolExpr::Term(t.to_string())
    }

    #[test]
    fn single_term() {
        assert_eq!(parse("Rust").unwrap(), term("rust"));
    }

    #[test]
    fn implicit_and() {
        assert_eq!(
            parse("binary trees").unwrap(),
            BoolExpr::And(vec![term("binary"), term("trees")])
        );
    }

    #[test]
    fn not_binds_tighter_than_and_binds_tighter_than_or() {
        let expr = parse("a OR b AND NOT c").unwrap();
        assert_eq!(
            expr,
            BoolExpr::Or(vec![
                term("a"),
                BoolExpr::And(vec![
                    term("b"),
                    BoolExpr::Not(Box::new(term("c")))
                ]),
            ])
        );
    }

    #[test]
    fn parentheses_override_precedence() {
        let expr = parse("(a OR b) AND c").unwrap();
        assert_eq!(
            expr,
            BoolExpr::And(vec![BoolExpr::Or(vec![term("a"), term("b")]), term("c")])
        );
    }

    #[test]
    fn operators_are_case_insensitive() {
        assert_eq!(parse("a and not b").unwrap(), parse("a AND NOT b").unwrap());
    }

    #[test]
    fn phrases_keep_word_order() {
        assert_eq!(
            parse("\"Binary Search\" trees").unwrap(),
            BoolExpr::And(vec![
                BoolExpr::Phrase(vec!["binary".into(), "search".into()]),
                term("trees"),
            ])
        );
    }

    #[test]
    fn syntax_errors() {
        let cases = [
            ("", "empty expression"),
            ("a AND", "expected a term"),
            ("OR b", "operator missing left operand"),
            ("NOT", "NOT missing operand"),
            ("(a OR b", "mismatched parenthesis"),
            ("a)", "mismatched parenthesis"),
            ("()", "empty parentheses"),
            ("\"open phrase", "unterminated phrase"),
        ];
        for (input, message) in cases {
            let err = parse(input).unwrap_err();
            assert_eq!(err.message, message, "input: {input:?}");
        }
    }

    #[test]
    fn error_positions_point_at_offending_token() {
        assert_eq!(parse("a AND").unwrap_err().position, 5);
        assert_eq!(parse("a b)").unwrap_err().position, 3);
    }

    #[test]
    fn excluded_terms_only_from_top_level_conjunction() {
        let expr = parse("trees AND NOT graphs").unwrap();
        assert_eq!(expr.excluded_terms(), vec!["graphs".to_string()]);
        assert_eq!(expr.positive_terms(), vec!["trees".to_string()]);

        let expr = parse("trees OR NOT graphs").unwrap();
        assert!(expr.excluded_terms().is_empty());

        let expr = parse("NOT (graphs OR cycles)").unwrap();
        assert_eq!(expr.excluded_terms(), vec!["graphs", "cycles"]);
    }

    #[test]
    fn normalized_query_keeps_original_casing() {
        let (q, err) = NormalizedQuery::new("  Binary   Trees ").unwrap();
        assert!(err.is_none());
        assert_eq!(q.original, "Binary Trees");
        assert_eq!(q.normalized, "binary trees");
        assert_eq!(q.terms, vec!["binary", "trees"]);
    }

    #[test]
    fn normalized_query_reports_syntax_error_but_keeps_terms() {
        let (q, err) = NormalizedQuery::new("trees AND (graphs").unwrap();
        assert!(err.is_some());
        assert!(q.expression.is_none());
        assert_eq!(q.terms, vec!["trees", "graphs"]);
    }

    #[test]
    fn blank_query_is_none() {
        assert!(NormalizedQuery::new("   ").is_none());
    }

    #[test]
    fn negated_words_never_become_search_terms() {
        let (q, err) = NormalizedQuery::new("trees AND NOT graphs").unwrap();
        assert!(err.is_none());
        assert_eq!(q.terms, vec!["trees"]);
        assert_eq!(q.excluded, vec!["graphs"]);

        // the bare-word fallback still drops the negated word
        let (q, err) = NormalizedQuery::new("trees AND NOT graphs (").unwrap();
        assert!(err.is_some());
        assert_eq!(q.terms, vec!["trees"]);
        assert!(q.excluded.is_empty());
    }

    #[test]
    fn semantic_text_drops_operators() {
        let (q, _) = NormalizedQuery::new("trees AND NOT graphs").unwrap();
        assert_eq!(q.semantic_text(), "trees");
    }
}
