//! Derived ratios shared by the order and video roll-ups.

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Totals {
  pub cost: f64,
  pub plays: i64,
  pub likes: i64,
  pub shares: i64,
  pub conversions: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedMetrics {
  pub play_per_100_cost: f64,
  /// `None` when there were no conversions; never zero-filled.
  pub avg_convert_cost: Option<f64>,
  pub share_rate: f64,
  pub like_rate: f64,
  pub share_per_100_play: f64,
}

pub fn round_to(value: f64, places: i32) -> f64 {
  let factor = 10f64.powi(places);
  (value * factor).round() / factor
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
  if denominator > 0.0 {
    numerator / denominator
  } else {
    0.0
  }
}

pub fn derive(totals: &Totals) -> DerivedMetrics {
  let plays = totals.plays as f64;

  let avg_convert_cost = if totals.conversions > 0 {
    Some(round_to(totals.cost / totals.conversions as f64, 2))
  } else {
    None
  };

  DerivedMetrics {
    play_per_100_cost: round_to(ratio(plays, totals.cost) * 100.0, 2),
    avg_convert_cost,
    share_rate: round_to(ratio(totals.shares as f64, plays), 4),
    like_rate: round_to(ratio(totals.likes as f64, plays), 4),
    share_per_100_play: round_to(ratio(totals.shares as f64, plays) * 100.0, 2),
  }
}
