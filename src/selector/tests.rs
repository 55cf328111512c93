use super::Selector;
use crate::ids::{DestinationUid, SysMessageId};
use crate::message::Packet;
use crate::utils::BrokerError;

fn packet() -> Packet {
    Packet::new(
        SysMessageId::new(10, 1),
        DestinationUid::topic("stock.ibm").unwrap(),
        Vec::new(),
    )
    .with_priority(7)
    .with_type("quote")
    .with_property("symbol", "IBM")
    .with_property("price", 101.5)
    .with_property("volume", 2_000i64)
    .with_property("urgent", true)
}

fn matches(selector: &str) -> bool {
    Selector::compile(selector).unwrap().matches(&packet())
}

#[test]
fn test_comparisons() {
    assert!(matches("symbol = 'IBM'"));
    assert!(matches("symbol <> 'SUNW'"));
    assert!(matches("price > 100"));
    assert!(matches("volume >= 2000 AND price < 102.0"));
    assert!(!matches("volume < 10"));
    assert!(matches("urgent = TRUE"));
    assert!(matches("urgent"));
}

#[test]
fn test_headers() {
    let selector = Selector::compile("JMSPriority > 5 AND JMSType = 'quote'").unwrap();
    assert!(selector.uses_headers());
    assert!(!selector.uses_properties());
    assert!(selector.matches(&packet()));
    assert!(matches("JMSDeliveryMode = 'NON_PERSISTENT'"));
}

#[test]
fn test_arithmetic() {
    assert!(matches("price * 2 > 200"));
    assert!(matches("volume / 1000 = 2"));
    assert!(matches("-price < 0"));
    assert!(matches("(volume + 1) - 1 = 2000"));
}

#[test]
fn test_integer_overflow_is_unknown() {
    let p = packet().with_property("x", i64::MIN);
    for selector in ["-x > 0", "-x < 0", "x - 1 < 0", "NOT (-x > 0)"] {
        assert!(!Selector::compile(selector).unwrap().matches(&p), "{selector}");
    }
    assert!(Selector::compile("-x IS NULL").unwrap().matches(&p));
}

#[test]
fn test_between_in_like() {
    assert!(matches("price BETWEEN 100 AND 102"));
    assert!(matches("volume NOT BETWEEN 1 AND 10"));
    assert!(matches("symbol IN ('SUNW', 'IBM')"));
    assert!(matches("symbol NOT IN ('SUNW', 'HP')"));
    assert!(matches("symbol LIKE 'I_M'"));
    assert!(matches("symbol LIKE 'I%'"));
    assert!(!matches("symbol NOT LIKE '%B%'"));
}

#[test]
fn test_like_escape() {
    let p = packet().with_property("code", "100%");
    let s = Selector::compile("code LIKE '100\\%' ESCAPE '\\'").unwrap();
    assert!(s.matches(&p));
    let q = packet().with_property("code", "1000");
    assert!(!s.matches(&q));
}

#[test]
fn test_null_and_unknown_do_not_match() {
    assert!(matches("missing IS NULL"));
    assert!(matches("symbol IS NOT NULL"));
    assert!(!matches("missing = 5"));
    assert!(!matches("NOT (missing = 5)"));
    assert!(matches("missing = 5 OR symbol = 'IBM'"));
    assert!(!matches("missing = 5 AND symbol = 'IBM'"));
}

#[test]
fn test_type_mismatch_is_fail_closed() {
    assert!(!matches("symbol > 5"));
    assert!(!matches("symbol < 'Z'"));
    assert!(!matches("price LIKE '1%'"));
}

#[test]
fn test_invalid_selectors_rejected() {
    for bad in ["", "symbol =", "symbol = 'IBM", "price BETWEEN 1", "a IN (1", "AND", "a ~ b", "a NOT = 1"] {
        let err = Selector::compile(bad).unwrap_err();
        assert!(
            matches!(err, BrokerError::InvalidSelector { .. }),
            "{bad:?} gave {err:?}"
        );
    }
}

#[test]
fn test_keywords_are_case_insensitive() {
    assert!(matches("symbol = 'IBM' and price between 1 and 200"));
    assert!(matches("missing is null"));
}
