// 🔍 Similarity Scorer
//
// Token-set Jaccard on normalized names, with a floor of 0.7 when one name is
// contained in the other. Containment is textual ("maria fernanda" inside
// "maria fernanda lopez") or by tokens ("maria lopez" inside
// "maria fernanda lopez").

use std::collections::HashSet;

use crate::parser::normalize_name;

/// Score assigned when one normalized name contains the other
pub const CONTAINMENT_FLOOR: f64 = 0.7;

/// Similarity of two free-text names, in [0, 1]
pub fn score(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    score_normalized(&a, &b)
}

/// Same as `score` for names that are already normalized
pub fn score_normalized(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let tokens_a: HashSet<&str> = a.split(' ').collect();
    let tokens_b: HashSet<&str> = b.split(' ').collect();
    let union = tokens_a.union(&tokens_b).count();
    let jaccard = if union == 0 {
        0.0
    } else {
        tokens_a.intersection(&tokens_b).count() as f64 / union as f64
    };

    let contained = a.contains(b)
        || b.contains(a)
        || tokens_a.is_subset(&tokens_b)
        || tokens_b.is_subset(&tokens_a);

    if contained {
        jaccard.max(CONTAINMENT_FLOOR)
    } else {
        jaccard
    }
}

/// Two-decimal rounding used for reported scores
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
