use crate::calibration::Prob3;
use crate::snapshot::BookmakerOdds;

/// Implied probabilities for the markets the analysis compares against.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImpliedProbabilities {
    pub sign: Option<Prob3>,
    pub over_2_5: Option<f64>,
    pub btts_yes: Option<f64>,
}

impl ImpliedProbabilities {
    pub fn from_odds(odds: &BookmakerOdds) -> Self {
        let sign = match (odds.home, odds.draw, odds.away) {
            (Some(h), Some(d), Some(a)) => no_vig_three_way(h, d, a),
            _ => None,
        };
        Self {
            sign,
            over_2_5: two_way_first(odds.over_2_5, odds.under_2_5),
            btts_yes: two_way_first(odds.btts_yes, odds.btts_no),
        }
    }
}

pub fn no_vig_three_way(home: f64, draw: f64, away: f64) -> Option<Prob3> {
    let ih = inverse_price(home)?;
    let id = inverse_price(draw)?;
    let ia = inverse_price(away)?;
    let sum = ih + id + ia;
    if sum <= 0.0 {
        return None;
    }
    Some(Prob3 {
        home: ih / sum,
        draw: id / sum,
        away: ia / sum,
    })
}

/// Probability of the first side of a two-way market. With only one price available the
/// margin cannot be removed, so the raw inverse is used.
pub fn two_way_first(first: Option<f64>, second: Option<f64>) -> Option<f64> {
    let a = first.and_then(inverse_price);
    let b = second.and_then(inverse_price);
    match (a, b) {
        (Some(a), Some(b)) => Some(a / (a + b)),
        (Some(a), None) => Some(a.min(1.0)),
        (None, Some(b)) => Some((1.0 - b).max(0.0)),
        (None, None) => None,
    }
}

fn inverse_price(price: f64) -> Option<f64> {
    if price.is_finite() && price > 1.0 {
        Some(1.0 / price)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_vig_probs_sum_to_one() {
        let p = no_vig_three_way(2.10, 3.40, 3.60).expect("valid");
        assert!((p.home + p.draw + p.away - 1.0).abs() < 1e-9);
        assert!(p.home > p.away);
    }

    #[test]
    fn prices_at_or_below_one_are_ignored() {
        assert!(no_vig_three_way(1.0, 3.4, 3.6).is_none());
        assert_eq!(two_way_first(Some(0.9), None), None);
    }

    #[test]
    fn two_way_removes_margin() {
        let p = two_way_first(Some(1.90), Some(1.90)).unwrap();
        assert!((p - 0.5).abs() < 1e-12);
    }

    #[test]
    fn implied_from_partial_odds() {
        let odds = BookmakerOdds {
            home: Some(1.5),
            draw: Some(4.0),
            away: None,
            over_2_5: Some(1.8),
            under_2_5: Some(2.0),
            ..Default::default()
        };
        let implied = ImpliedProbabilities::from_odds(&odds);
        assert!(implied.sign.is_none());
        assert!(implied.over_2_5.unwrap() > 0.5);
        assert!(implied.btts_yes.is_none());
    }
}
