//! Serde adapters that carry `f64` as its IEEE-754 bit pattern.
//!
//! Text formats lose non-finite values (serde_json writes NaN and inf as
//! `null`) and may parse a float back one ulp off. Bits survive any format
//! exactly. Use with `#[serde(with = "strata_matrix::bits")]` on an `f64`
//! or `#[serde(with = "strata_matrix::bits::vec")]` on a `Vec<f64>`.

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.to_bits())
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    u64::deserialize(deserializer).map(f64::from_bits)
}

pub mod vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|v| v.to_bits()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let bits = Vec::<u64>::deserialize(deserializer)?;
        Ok(bits.into_iter().map(f64::from_bits).collect())
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use crate::{ColFactors, RowFactors, SparseMatrix};

    #[derive(Debug, Serialize, Deserialize)]
    struct Step {
        #[serde(with = "crate::bits")]
        eps: f64,
    }

    #[test]
    fn non_finite_factors_survive_json() {
        let mut h = ColFactors::from_fn(2, 3, |k, j| (k + j) as f64 / 3.0);
        h.col_mut(1)[0] = f64::INFINITY;
        h.col_mut(2)[1] = f64::NAN;
        let back: ColFactors = serde_json::from_str(&serde_json::to_string(&h).unwrap()).unwrap();
        let bits = |c: &ColFactors| c.as_slice().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&back), bits(&h));
        assert_eq!((back.rank(), back.cols()), (2, 3));
    }

    #[test]
    fn json_floats_come_back_bit_exact() {
        let w = RowFactors::from_fn(4, 3, |i, k| 1.0037916892306158 + (i * 3 + k) as f64 / 7.0);
        let back: RowFactors = serde_json::from_str(&serde_json::to_string(&w).unwrap()).unwrap();
        for (a, b) in w.as_slice().iter().zip(back.as_slice()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }

        let v = SparseMatrix::from_triplets(2, 2, [(0, 1, 0.1 + 0.2), (1, 0, -f64::INFINITY)]).unwrap();
        let back: SparseMatrix = serde_json::from_str(&serde_json::to_string(&v).unwrap()).unwrap();
        assert_eq!(back.vals[0].to_bits(), (0.1f64 + 0.2).to_bits());
        assert_eq!(back.vals[1], f64::NEG_INFINITY);
    }

    #[test]
    fn scalar_nan_keeps_its_payload() {
        let nan = f64::from_bits(0x7ff8_0000_0000_0123);
        let back: Step = serde_json::from_str(&serde_json::to_string(&Step { eps: nan }).unwrap()).unwrap();
        assert_eq!(back.eps.to_bits(), nan.to_bits());
    }
}
