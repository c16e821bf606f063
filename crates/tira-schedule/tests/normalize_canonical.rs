use tira_schedule::normalize_schedule;

#[test]
fn empty_string_is_identity() {
    assert_eq!(normalize_schedule("").expect("empty"), "");
    assert_eq!(normalize_schedule("   \t\n").expect("blank"), "");
}

#[test]
fn whitespace_between_tokens_is_dropped() {
    let normalized = normalize_schedule("S( L0 , L1 , 4 , 8 , comps=['c1'] )").expect("parse");
    assert!(!normalized.contains(' '));
    assert_eq!(normalized, "S(L0,L1,4,8,comps=['c1'])");
}

#[test]
fn unquoted_comp_names_become_single_quoted() {
    let normalized = normalize_schedule("S(L0,L1,4,8,comps=[c1])").expect("parse");
    assert_eq!(normalized, "S(L0,L1,4,8,comps=['c1'])");
}

#[test]
fn double_quotes_become_single_quotes() {
    let normalized = normalize_schedule("S(L0,L1,4,8,comps=[\"c1\",\"c2\"])").expect("parse");
    assert_eq!(normalized, "S(L0,L1,4,8,comps=['c1','c2'])");
}

#[test]
fn already_canonical_is_fixed_point() {
    let canonical = "S(L0,L1,4,8,comps=['comp_a','comp_b'])";
    assert_eq!(normalize_schedule(canonical).expect("parse"), canonical);
}

#[test]
fn mixed_quoting_is_unified() {
    let normalized = normalize_schedule("S(L0,L1,4,8,comps=['c1',\"c2\",c3])").expect("parse");
    assert_eq!(normalized, "S(L0,L1,4,8,comps=['c1','c2','c3'])");
}

#[test]
fn multi_atom_schedule_keeps_order() {
    let normalized =
        normalize_schedule("S(L0,L1,4,8,comps=[c1]) | I(L0,L1,comps=[c2])").expect("parse");
    assert_eq!(normalized, "S(L0,L1,4,8,comps=['c1'])|I(L0,L1,comps=['c2'])");
}

#[test]
fn reversal_with_double_quoted_comp() {
    // The canonical form keeps the atom shape and requotes the identifier.
    let normalized = normalize_schedule("R( L0 , comps=[\"c1\"] )").expect("parse");
    assert_eq!(normalized, "R(L0,comps=['c1'])");
}

#[test]
fn whitespace_inside_quoted_comp_is_preserved() {
    let normalized = normalize_schedule("R(L0,comps=[\"comp a\"])").expect("parse");
    assert_eq!(normalized, "R(L0,comps=['comp a'])");
}

#[test]
fn atom_without_comps_round_trips() {
    let normalized = normalize_schedule("P( L0 )").expect("parse");
    assert_eq!(normalized, "P(L0)");
}

#[test]
fn negative_skew_factors_round_trip() {
    let normalized = normalize_schedule("S(L0,L1,-1,2,comps=['c'])").expect("parse");
    assert_eq!(normalized, "S(L0,L1,-1,2,comps=['c'])");
}

#[test]
fn normalization_is_idempotent() {
    let inputs = [
        "S(L0,L1,4,8,comps=[c1]) | T3( L0, L1, L2, 8, 16, 32, comps=[\"a\", b] )",
        "U(L1,4,comps=['u'])|F(L0,L1)",
    ];
    for input in inputs {
        let once = normalize_schedule(input).expect("first pass");
        let twice = normalize_schedule(&once).expect("second pass");
        assert_eq!(once, twice);
    }
}
