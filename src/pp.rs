//! Pure PP scoring engine: the community-agreed accuracy curve, weighted-sum
//! aggregation, and the inverse "raw PP needed for a target gain" solvers.

/// Decay applied to each successive score in a player's PP-sorted list.
pub const WEIGHT_COEFFICIENT: f64 = 0.965;
/// Scales the curve multiplier by map difficulty.
pub const STAR_MULTIPLIER: f64 = 42.117208413;

/// (accuracy fraction, multiplier) control points, accuracy strictly
/// increasing from 0 to 1.  These values encode community-agreed scoring
/// balance and are not derivable from a formula; do not edit them without a
/// community decision.
pub const CURVE_POINTS: [(f64, f64); 37] = [
  (0., 0.),
  (0.6, 0.18223233667439062),
  (0.65, 0.5866010012767576),
  (0.7, 0.6125565959114954),
  (0.75, 0.6451808210101443),
  (0.8, 0.6872268862950283),
  (0.825, 0.7150465663454271),
  (0.85, 0.7462290664143185),
  (0.875, 0.7816934560296046),
  (0.9, 0.825756123560842),
  (0.91, 0.8488375988124467),
  (0.92, 0.8728710341448851),
  (0.93, 0.9039994071865736),
  (0.94, 0.9417362980580238),
  (0.95, 1.),
  (0.955, 1.0388633331418984),
  (0.96, 1.0871883573850478),
  (0.965, 1.1552120359501035),
  (0.97, 1.2485807759957321),
  (0.9725, 1.3090333065057616),
  (0.975, 1.3807102743105126),
  (0.9775, 1.4664726399289512),
  (0.98, 1.5702410055532239),
  (0.9825, 1.697536248647543),
  (0.985, 1.8563887693647105),
  (0.9875, 2.058947159052738),
  (0.99, 2.324506282149922),
  (0.99125, 2.4902905794106913),
  (0.9925, 2.685667856592722),
  (0.99375, 2.9190155639254955),
  (0.995, 3.2022017597337955),
  (0.99625, 3.5526145337555373),
  (0.9975, 3.996793606763322),
  (0.99825, 4.325027383589547),
  (0.999, 4.715470646416203),
  (0.9995, 5.019543595874787),
  (1., 5.367394282890631),
];

fn lerp(a: f64, b: f64, t: f64) -> f64 { a + (b - a) * t }

/// Looks up the curve multiplier for an accuracy given in percent (0-100).
/// Below the first control point the multiplier is 0; at or above 100% it is
/// the last control point's value; in between it is linearly interpolated
/// between the bracketing control points.
pub fn curve_multiplier(accuracy: f64) -> f64 {
  let accuracy = accuracy.clamp(0., 100.) / 100.;

  if accuracy <= 0. {
    return 0.;
  }
  if accuracy >= 1. {
    return CURVE_POINTS[CURVE_POINTS.len() - 1].1;
  }

  for window in CURVE_POINTS.windows(2) {
    let (prev_acc, prev_mult) = window[0];
    let (next_acc, next_mult) = window[1];
    if prev_acc <= accuracy && accuracy <= next_acc {
      let t = (accuracy - prev_acc) / (next_acc - prev_acc);
      return lerp(prev_mult, next_mult, t);
    }
  }

  0.
}

/// Computes PP for a play.  `accuracy` may be given either as a fraction
/// (0-1] or in percent (0-100]; values <= 1 are treated as fractions.
pub fn compute_pp(stars: f64, accuracy: f64) -> f64 {
  let accuracy = if accuracy <= 1. { accuracy * 100. } else { accuracy };
  curve_multiplier(accuracy) * stars * STAR_MULTIPLIER
}

/// Weighted sum of a PP list: the i-th entry contributes
/// `WEIGHT_COEFFICIENT^(i + start_idx) * pp[i]`.  The caller must pre-sort
/// descending; no sorting happens here.
pub fn weighted_total(pps_desc: &[f64], start_idx: usize) -> f64 {
  pps_desc
    .iter()
    .enumerate()
    .map(|(ix, pp)| WEIGHT_COEFFICIENT.powi((ix + start_idx) as i32) * pp)
    .sum()
}

/// Solves for the raw PP that, inserted at `idx`, changes the weighted total
/// by exactly `expected`.  `bottom_scores` is the slice of existing scores at
/// and below the insertion point; inserting shifts each of them down one
/// weight slot.
fn raw_pp_at_idx(bottom_scores: &[f64], idx: usize, expected: f64) -> f64 {
  let old_bottom = weighted_total(bottom_scores, idx);
  let new_bottom = weighted_total(bottom_scores, idx + 1);

  (expected + old_bottom - new_bottom) / WEIGHT_COEFFICIENT.powi(idx as i32)
}

/// Raw PP a new top score must carry to raise the weighted total by at least
/// `expected_gain`, given the player's existing PP list sorted descending.
///
/// Bisects over insertion positions to find the deepest index where inserting
/// a score equal to the resident one still gains more than the target, then
/// solves the closed form one slot below.  Falls back to solving at index 0
/// when no position satisfies the inequality.  `weighted_gain_for_raw_pp` is
/// the independent cross-check for this; the two must agree to float
/// tolerance.
pub fn raw_pp_for_expected_gain(pps_desc: &[f64], expected_gain: f64) -> f64 {
  let mut left: isize = 0;
  let mut right: isize = pps_desc.len() as isize - 1;
  let mut boundary_idx: isize = -1;

  while left <= right {
    let mid = ((left + right) / 2) as usize;
    let bottom_slice = &pps_desc[mid..];
    let bottom_pp = weighted_total(bottom_slice, mid);

    let mut shifted = Vec::with_capacity(bottom_slice.len() + 1);
    shifted.push(pps_desc[mid]);
    shifted.extend_from_slice(bottom_slice);
    let shifted_pp = weighted_total(&shifted, mid);

    if shifted_pp - bottom_pp > expected_gain {
      boundary_idx = mid as isize;
      left = mid as isize + 1;
    } else {
      right = mid as isize - 1;
    }
  }

  if boundary_idx < 0 {
    return raw_pp_at_idx(pps_desc, 0, expected_gain);
  }

  let boundary = boundary_idx as usize;
  raw_pp_at_idx(&pps_desc[boundary + 1..], boundary + 1, expected_gain)
}

/// Net weighted-total gain from adding a score worth `raw_pp` to the list:
/// inserts it at its sorted position and diffs the before/after totals.  The
/// straightforward counterpart to `raw_pp_for_expected_gain`.
pub fn weighted_gain_for_raw_pp(pps_desc: &[f64], raw_pp: f64) -> f64 {
  if pps_desc.is_empty() {
    return raw_pp;
  }

  let insert_idx = pps_desc
    .iter()
    .position(|&pp| raw_pp > pp)
    .unwrap_or(pps_desc.len());
  let mut with_new = pps_desc.to_vec();
  with_new.insert(insert_idx, raw_pp);

  weighted_total(&with_new, 0) - weighted_total(pps_desc, 0)
}
