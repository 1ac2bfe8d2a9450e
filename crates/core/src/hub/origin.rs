//! Origin policy: who an endpoint is willing to talk to.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use regex::Regex;

use crate::context::MessageContext;
use crate::proto::Frame;

/// Structural origin matcher: a literal, a pattern, or any-of a list.
/// The literal `"*"` matches everything.
#[derive(Clone)]
pub enum OriginMatcher {
    /// Allow every origin.
    Any,
    /// Exact origin string.
    Exact(String),
    /// Regular expression over the origin.
    Pattern(Regex),
    /// Any-of.
    List(Vec<OriginMatcher>),
}

impl OriginMatcher {
    /// Whether `origin` is allowed.
    #[must_use]
    pub fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == "*" || expected == origin,
            Self::Pattern(pattern) => pattern.is_match(origin),
            Self::List(matchers) => matchers.iter().any(|matcher| matcher.matches(origin)),
        }
    }
}

impl From<&str> for OriginMatcher {
    fn from(origin: &str) -> Self {
        if origin == "*" {
            Self::Any
        } else {
            Self::Exact(origin.to_owned())
        }
    }
}
impl From<String> for OriginMatcher {
    fn from(origin: String) -> Self {
        origin.as_str().into()
    }
}
impl From<Regex> for OriginMatcher {
    fn from(pattern: Regex) -> Self {
        Self::Pattern(pattern)
    }
}
impl<T: Into<OriginMatcher>> From<Vec<T>> for OriginMatcher {
    fn from(matchers: Vec<T>) -> Self {
        Self::List(matchers.into_iter().map(Into::into).collect())
    }
}

impl Debug for OriginMatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::Exact(origin) => write!(f, "Exact({origin})"),
            Self::Pattern(pattern) => write!(f, "Pattern({pattern})"),
            Self::List(matchers) => f.debug_list().entries(matchers).finish(),
        }
    }
}

/// Caller-supplied origin check with full frame context. Returning `false`
/// denies the delivery.
pub type OriginValidator = Arc<dyn Fn(&str, &Frame, &MessageContext) -> bool + Send + Sync>;

/// Compile a matcher into a validator callback.
#[must_use]
pub fn validator_from_matcher(matcher: OriginMatcher) -> OriginValidator {
    Arc::new(move |origin, _frame, _context| matcher.matches(origin))
}

/// Resolve an origin decision.
///
/// An explicit validator always wins; otherwise a concrete expected origin
/// is compared literally (`"*"` means indifferent); with neither, the
/// delivery is allowed.
#[must_use]
pub fn is_origin_allowed(
    origin: &str,
    frame: &Frame,
    context: &MessageContext,
    expected_origin: Option<&str>,
    validator: Option<&OriginValidator>,
) -> bool {
    if let Some(validator) = validator {
        return validator(origin, frame, context);
    }
    if let Some(expected) = expected_origin {
        if expected != "*" {
            return expected == origin;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::kind;

    fn frame() -> Frame {
        Frame::new(kind::PING, "r1")
    }

    #[test]
    fn matcher_shapes() {
        assert!(OriginMatcher::from("*").matches("https://anything.test"));
        assert!(OriginMatcher::from("https://ok.test").matches("https://ok.test"));
        assert!(!OriginMatcher::from("https://ok.test").matches("https://bad.test"));

        let pattern = OriginMatcher::from(Regex::new(r"^https://.*\.corp\.test$").expect("regex"));
        assert!(pattern.matches("https://app.corp.test"));
        assert!(!pattern.matches("https://corp.test.evil"));

        let list: OriginMatcher = vec!["https://a.test", "https://b.test"].into();
        assert!(list.matches("https://b.test"));
        assert!(!list.matches("https://c.test"));
    }

    #[test]
    fn validator_wins_over_expected_origin() {
        let context = MessageContext::new("https://bad.test", None);
        let deny: OriginValidator = Arc::new(|_, _, _| false);
        // Expected origin would allow, the validator still denies.
        assert!(!is_origin_allowed(
            "https://bad.test",
            &frame(),
            &context,
            Some("https://bad.test"),
            Some(&deny),
        ));
    }

    #[test]
    fn expected_origin_is_literal() {
        let context = MessageContext::new("https://ok.test", None);
        assert!(is_origin_allowed(
            "https://ok.test",
            &frame(),
            &context,
            Some("https://ok.test"),
            None,
        ));
        assert!(!is_origin_allowed(
            "https://bad.test",
            &frame(),
            &context,
            Some("https://ok.test"),
            None,
        ));
        // "*" and absent both mean indifferent.
        assert!(is_origin_allowed("https://x.test", &frame(), &context, Some("*"), None));
        assert!(is_origin_allowed("https://x.test", &frame(), &context, None, None));
    }
}
