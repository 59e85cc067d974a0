//! A minimal, best-effort GraphQL operation-type classifier.
//!
//! This is deliberately not a real GraphQL parser: per this system's scope,
//! the GraphQL execution engine owns full query parsing. All this classifier
//! needs is enough of a scan to find the keyword of the first operation
//! definition, so the dispatcher knows whether to invoke the executor's
//! single-shot or streaming entry point. A query the classifier cannot make
//! sense of is left to the executor, which will report the syntax error as an
//! ordinary GraphQL error.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// Scans `query` for the keyword of its first operation definition.
///
/// Handles the anonymous shorthand (`{ field }`, which is always a query),
/// leading whitespace, and `#`-prefixed line comments, mirroring what a
/// client would actually send. Returns `None` if no operation keyword or
/// opening brace is found before the input is exhausted.
pub fn classify_operation(query: &str) -> Option<OperationKind> {
    let mut chars = query.char_indices().peekable();

    loop {
        skip_insignificant(&mut chars);
        let (start, c) = *chars.peek()?;
        if c == '{' {
            return Some(OperationKind::Query);
        }
        if !c.is_alphabetic() {
            return None;
        }
        let end = read_word_end(query, start);
        let word = &query[start..end];
        return match word {
            "query" => Some(OperationKind::Query),
            "mutation" => Some(OperationKind::Mutation),
            "subscription" => Some(OperationKind::Subscription),
            _ => None,
        };
    }
}

fn skip_insignificant(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) {
    while let Some(&(_, c)) = chars.peek() {
        if c.is_whitespace() || c == ',' {
            chars.next();
        } else if c == '#' {
            for (_, c) in chars.by_ref() {
                if c == '\n' {
                    break;
                }
            }
        } else {
            break;
        }
    }
}

fn read_word_end(query: &str, start: usize) -> usize {
    query[start..]
        .find(|c: char| !c.is_alphanumeric() && c != '_')
        .map(|offset| start + offset)
        .unwrap_or(query.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_explicit_keywords() {
        assert_eq!(
            classify_operation("query Foo { q }"),
            Some(OperationKind::Query)
        );
        assert_eq!(
            classify_operation("mutation Foo { m }"),
            Some(OperationKind::Mutation)
        );
        assert_eq!(
            classify_operation("subscription Foo { s }"),
            Some(OperationKind::Subscription)
        );
    }

    #[test]
    fn anonymous_shorthand_is_a_query() {
        assert_eq!(classify_operation("{ q }"), Some(OperationKind::Query));
        assert_eq!(classify_operation("  { q }"), Some(OperationKind::Query));
    }

    #[test]
    fn skips_leading_comments_and_whitespace() {
        let query = "# a comment\n\n  subscription { s }";
        assert_eq!(
            classify_operation(query),
            Some(OperationKind::Subscription)
        );
    }

    #[test]
    fn unparseable_input_yields_none() {
        assert_eq!(classify_operation(""), None);
        assert_eq!(classify_operation("not graphql at all ###"), None);
        assert_eq!(classify_operation("123 { q }"), None);
    }
}
