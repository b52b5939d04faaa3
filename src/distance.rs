/// Defines different distance metrics such that a distance of zero is perfect.
use serde::{Serialize,Deserialize};

#[derive(Copy,Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub enum Distance {
    /// Cosine distance
    Cosine,

    /// Simple Dot distance.  We modify it by taking the negative, so lower is closer.  Not a true
    /// distance but oh well
    Dot,

    /// Simple L2 Norm Euclidean Distance
    Euclidean
}

impl Distance {

    fn fast_cosine(e1: &[f32], e2: &[f32]) -> f32 {
        let mut d1 = 0.;
        let mut d2 = 0.;
        let dot = e1.iter().zip(e2.iter()).map(|(ei, ej)| {
            d1 += ei.powf(2.);
            d2 += ej.powf(2.);
            ei * ej
        }).sum::<f32>();
        let cosine_score = dot / (d1.sqrt() * d2.sqrt());
        if cosine_score.is_nan() {
            std::f32::INFINITY
        } else {
            -cosine_score + 1.
        }
    }

    pub fn compute(&self, e1: &[f32], e2: &[f32]) -> f32 {
        match &self {
            Distance::Cosine => Distance::fast_cosine(e1, e2),

            Distance::Euclidean => {
                e1.iter().zip(e2.iter()).map(|(ei, ej)| {
                    (*ei - *ej).powf(2.)
                }).sum::<f32>().sqrt()
            },

            Distance::Dot => {
                -e1.iter().zip(e2.iter()).map(|(ei, ej)| {
                    *ei * *ej
                }).sum::<f32>()
            }
        }
    }
}
