//! Defines the different losses for use within the Embedding Propagation framework.
//! Admitedly, the EP framework isn't parameterized on loss, so technically choosing a loss other
//! than Margin Loss is a different optimizer.
//!
//! Every loss compares an anchor `a` (the node built from its own features) against a positive
//! `p` (its reconstruction from the neighborhood) and a set of negatives, returning the loss with
//! its gradients w.r.t. each input.
use serde::{Serialize,Deserialize};

use crate::algos::utils::{dot,l2norm,axpy,all_finite};
use crate::error::{Error,Result};
use super::attention::softmax;

const NORM_EPS: f32 = 1e-8;

#[derive(Copy,Clone,Debug,PartialEq,Serialize,Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Similarity {
    Dot,
    Cosine
}

impl Similarity {
    pub fn compute(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Similarity::Dot => dot(a, b),
            Similarity::Cosine => {
                dot(a, b) / (l2norm(a).max(NORM_EPS) * l2norm(b).max(NORM_EPS))
            }
        }
    }

    /// Similarity along with its gradients w.r.t. `a` and `b`.
    pub fn forward_backward(&self, a: &[f32], b: &[f32]) -> (f32, Vec<f32>, Vec<f32>) {
        match self {
            Similarity::Dot => (dot(a, b), b.to_vec(), a.to_vec()),
            Similarity::Cosine => {
                let na = l2norm(a).max(NORM_EPS);
                let nb = l2norm(b).max(NORM_EPS);
                let s = dot(a, b) / (na * nb);
                let da = a.iter().zip(b.iter())
                    .map(|(ai, bi)| bi / (na * nb) - s * ai / (na * na))
                    .collect();
                let db = a.iter().zip(b.iter())
                    .map(|(ai, bi)| ai / (na * nb) - s * bi / (nb * nb))
                    .collect();
                (s, da, db)
            }
        }
    }
}

#[derive(Copy,Clone,Debug,PartialEq,Serialize,Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    /// This is the max margin loss with threshold that's common in embedding work.  FaceNet was
    /// one of the first to define it and a good starting point
    MarginLoss { margin: f32, negatives: usize },

    /// Contrastive Loss is another embedding approach; two margins are provided: a positive and a
    /// negative margin, moderating how much each matters
    Contrastive { pos_margin: f32, neg_margin: f32, negatives: usize },

    /// Max margin against the hardest negative only, as used in the StarSpace paper
    StarSpace { margin: f32, negatives: usize },

    /// This use negative log likelihood to maximize a 1-of-N ranked list.  Only applied while the
    /// positive's probability is below `tau`.
    RankLoss { tau: f32, negatives: usize },

    /// This combines StarSpace and RankLoss, with `tau` acting as both the margin and the rank
    /// threshold
    RankSpace { tau: f32, negatives: usize },

    /// Margin loss where the positive is the visitation weighted mean of `num` personalized
    /// page rank walks.  `num` negatives are drawn as well.
    PPR { margin: f32, num: usize, restart_p: f32 }
}

/// Loss value with gradients for each input.
#[derive(Clone,Debug)]
pub struct LossOutput {
    pub loss: f32,
    pub d_anchor: Vec<f32>,
    pub d_positive: Vec<f32>,
    pub d_negatives: Vec<Vec<f32>>
}

impl LossOutput {
    fn zero(dims: usize, negatives: usize) -> Self {
        LossOutput {
            loss: 0.,
            d_anchor: vec![0.; dims],
            d_positive: vec![0.; dims],
            d_negatives: vec![vec![0.; dims]; negatives]
        }
    }

    pub fn scale(&mut self, weight: f32) {
        self.loss *= weight;
        self.d_anchor.iter_mut().for_each(|g| *g *= weight);
        self.d_positive.iter_mut().for_each(|g| *g *= weight);
        self.d_negatives.iter_mut().for_each(|gs| gs.iter_mut().for_each(|g| *g *= weight));
    }

    pub fn is_finite(&self) -> bool {
        self.loss.is_finite()
            && all_finite(&self.d_anchor)
            && all_finite(&self.d_positive)
            && self.d_negatives.iter().all(|g| all_finite(g))
    }
}

impl Loss {
    pub fn negatives(&self) -> usize {
        match self {
            Loss::Contrastive { negatives, .. } => *negatives,
            Loss::MarginLoss { negatives, .. }  => *negatives,
            Loss::StarSpace { negatives, .. }   => *negatives,
            Loss::RankLoss { negatives, .. }    => *negatives,
            Loss::RankSpace { negatives, .. }   => *negatives,
            Loss::PPR { num, .. }               => *num
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::InvalidConfig(msg));
        match self {
            Loss::MarginLoss { margin, .. } | Loss::StarSpace { margin, .. } if !margin.is_finite() => {
                bad(format!("margin must be finite, got {}", margin))
            },
            Loss::RankLoss { tau, .. } | Loss::RankSpace { tau, .. } if !(tau.is_finite() && *tau > 0.) => {
                bad(format!("tau must be positive, got {}", tau))
            },
            Loss::Contrastive { pos_margin, neg_margin, .. } if !(pos_margin.is_finite() && neg_margin.is_finite()) => {
                bad("contrastive margins must be finite".into())
            },
            Loss::PPR { num, .. } if *num == 0 => bad("ppr requires at least one walk".into()),
            Loss::PPR { restart_p, .. } if !(*restart_p >= 0. && *restart_p <= 1.) => {
                bad(format!("restart probability must be in [0, 1], got {}", restart_p))
            },
            _ => Ok(())
        }
    }

    /// Selects the loss from a set of objective flags, exactly one of which must be set.
    pub fn from_objectives(opts: &ObjectiveOptions) -> Result<Self> {
        let mut selected = Vec::with_capacity(1);
        if let Some((margin, negatives)) = opts.margin {
            selected.push(Loss::MarginLoss { margin, negatives });
        }
        if let Some((margin, negatives)) = opts.starspace {
            selected.push(Loss::StarSpace { margin, negatives });
        }
        if let Some((tau, negatives)) = opts.rank {
            selected.push(Loss::RankLoss { tau, negatives });
        }
        if let Some((tau, negatives)) = opts.rankspace {
            selected.push(Loss::RankSpace { tau, negatives });
        }
        if let Some((margin, num, restart_p)) = opts.ppr {
            selected.push(Loss::PPR { margin, num, restart_p });
        }
        if let Some((pos_margin, neg_margin, negatives)) = opts.contrastive {
            selected.push(Loss::Contrastive { pos_margin, neg_margin, negatives });
        }

        if selected.len() != 1 {
            return Err(Error::ObjectiveSelection(selected.len()))
        }
        let loss = selected[0];
        loss.validate()?;
        Ok(loss)
    }

    pub fn compute(
        &self,
        sim: Similarity,
        anchor: &[f32],
        positive: &[f32],
        negatives: &[Vec<f32>]
    ) -> LossOutput {
        let mut out = LossOutput::zero(anchor.len(), negatives.len());
        match self {
            Loss::MarginLoss { margin, .. } | Loss::PPR { margin, .. } => {
                margin_loss(sim, *margin, anchor, positive, negatives, &mut out);
            },
            Loss::StarSpace { margin, .. } => {
                star_space_loss(sim, *margin, anchor, positive, negatives, &mut out);
            },
            Loss::RankLoss { tau, .. } => {
                rank_loss(sim, *tau, anchor, positive, negatives, &mut out);
            },
            Loss::RankSpace { tau, .. } => {
                star_space_loss(sim, *tau, anchor, positive, negatives, &mut out);
                rank_loss(sim, *tau, anchor, positive, negatives, &mut out);
            },
            Loss::Contrastive { pos_margin, neg_margin, .. } => {
                contrastive_loss(sim, *pos_margin, *neg_margin, anchor, positive, negatives, &mut out);
            }
        }
        out
    }
}

// Hinge terms which contribute.  NaN terms stay in so the example gets flagged as non-finite.
fn active(l: f32) -> bool {
    l > 0. || l.is_nan()
}

// Averaged over the negatives violating the margin
fn margin_loss(
    sim: Similarity,
    margin: f32,
    anchor: &[f32],
    positive: &[f32],
    negatives: &[Vec<f32>],
    out: &mut LossOutput
) {
    let (s_p, da_p, dp) = sim.forward_backward(anchor, positive);
    let violations: Vec<_> = negatives.iter().enumerate().filter_map(|(i, neg)| {
        let (s_n, da_n, dn) = sim.forward_backward(anchor, neg);
        let l = margin - s_p + s_n;
        if active(l) { Some((i, l, da_n, dn)) } else { None }
    }).collect();

    if violations.is_empty() { return }

    let m = violations.len() as f32;
    out.loss += violations.iter().map(|v| v.1).sum::<f32>() / m;
    axpy(-1., &da_p, &mut out.d_anchor);
    axpy(-1., &dp, &mut out.d_positive);
    for (i, _, da_n, dn) in violations.into_iter() {
        axpy(1. / m, &da_n, &mut out.d_anchor);
        axpy(1. / m, &dn, &mut out.d_negatives[i]);
    }
}

fn star_space_loss(
    sim: Similarity,
    margin: f32,
    anchor: &[f32],
    positive: &[f32],
    negatives: &[Vec<f32>],
    out: &mut LossOutput
) {
    let hardest = negatives.iter().enumerate()
        .map(|(i, neg)| (i, sim.compute(anchor, neg)))
        .fold(None, |best: Option<(usize, f32)>, (i, s)| match best {
            Some((_, bs)) if bs >= s => best,
            _ => Some((i, s))
        });

    if let Some((i, _)) = hardest {
        let (s_p, da_p, dp) = sim.forward_backward(anchor, positive);
        let (s_n, da_n, dn) = sim.forward_backward(anchor, &negatives[i]);
        let l = margin - s_p + s_n;
        if active(l) {
            out.loss += l;
            axpy(-1., &da_p, &mut out.d_anchor);
            axpy(1., &da_n, &mut out.d_anchor);
            axpy(-1., &dp, &mut out.d_positive);
            axpy(1., &dn, &mut out.d_negatives[i]);
        }
    }
}

fn rank_loss(
    sim: Similarity,
    tau: f32,
    anchor: &[f32],
    positive: &[f32],
    negatives: &[Vec<f32>],
    out: &mut LossOutput
) {
    let mut grads = Vec::with_capacity(negatives.len() + 1);
    let mut probs = Vec::with_capacity(negatives.len() + 1);
    for neg in negatives.iter() {
        let (s, da, dn) = sim.forward_backward(anchor, neg);
        probs.push(s);
        grads.push((da, dn));
    }

    // Positive goes last
    let (s_p, da_p, dp) = sim.forward_backward(anchor, positive);
    probs.push(s_p);
    softmax(&mut probs);

    let p_pos = probs[negatives.len()];
    if p_pos >= tau { return }

    out.loss -= p_pos.max(std::f32::MIN_POSITIVE).ln();
    for (i, (da, dn)) in grads.into_iter().enumerate() {
        axpy(probs[i], &da, &mut out.d_anchor);
        axpy(probs[i], &dn, &mut out.d_negatives[i]);
    }
    axpy(p_pos - 1., &da_p, &mut out.d_anchor);
    axpy(p_pos - 1., &dp, &mut out.d_positive);
}

// Averaged over the non-zero hinge terms
fn contrastive_loss(
    sim: Similarity,
    pos_margin: f32,
    neg_margin: f32,
    anchor: &[f32],
    positive: &[f32],
    negatives: &[Vec<f32>],
    out: &mut LossOutput
) {
    let mut terms = Vec::with_capacity(negatives.len() + 1);

    let (s_p, da_p, dp) = sim.forward_backward(anchor, positive);
    let pos_l = pos_margin - s_p;
    if active(pos_l) {
        terms.push((None, pos_l, da_p, dp));
    }

    for (i, neg) in negatives.iter().enumerate() {
        let (s_n, da_n, dn) = sim.forward_backward(anchor, neg);
        let neg_l = s_n - neg_margin;
        if active(neg_l) {
            terms.push((Some(i), neg_l, da_n, dn));
        }
    }

    if terms.is_empty() { return }

    let m = terms.len() as f32;
    for (idx, l, da, db) in terms.into_iter() {
        out.loss += l / m;
        match idx {
            None => {
                axpy(-1. / m, &da, &mut out.d_anchor);
                axpy(-1. / m, &db, &mut out.d_positive);
            },
            Some(i) => {
                axpy(1. / m, &da, &mut out.d_anchor);
                axpy(1. / m, &db, &mut out.d_negatives[i]);
            }
        }
    }
}

/// Objective flags as provided by a front end.  Exactly one should be set.
#[derive(Clone,Debug,Default)]
pub struct ObjectiveOptions {
    pub margin: Option<(f32, usize)>,
    pub starspace: Option<(f32, usize)>,
    pub rank: Option<(f32, usize)>,
    pub rankspace: Option<(f32, usize)>,
    pub ppr: Option<(f32, usize, f32)>,
    pub contrastive: Option<(f32, f32, usize)>
}

/// Scales each example's loss by a function of the anchor's degree.
#[derive(Copy,Clone,Debug,PartialEq,Serialize,Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossWeighting {
    None,

    /// ln(1 + degree)
    Log,

    /// degree ^ w
    Exponential(f32)
}

impl Default for LossWeighting {
    fn default() -> Self {
        LossWeighting::None
    }
}

impl LossWeighting {
    /// Parses `none`, `log` or `exponential <w>`.
    pub fn parse(args: &[&str]) -> Result<Self> {
        match args {
            ["none"] | [] => Ok(LossWeighting::None),
            ["log"] => Ok(LossWeighting::Log),
            ["exponential", w] => {
                let w: f32 = w.parse()
                    .map_err(|_| Error::InvalidConfig(format!("exponential weight `{}` is not a number", w)))?;
                Ok(LossWeighting::Exponential(w))
            },
            ["exponential"] => Err(Error::InvalidConfig("exponential loss weighting requires a weight".into())),
            [kind, ..] => Err(Error::UnknownLossWeighting(kind.to_string()))
        }
    }

    pub fn weight(&self, degree: usize) -> f32 {
        match self {
            LossWeighting::None => 1.,
            LossWeighting::Log => (1. + degree as f32).ln(),
            LossWeighting::Exponential(w) => (degree as f32).powf(*w)
        }
    }
}

#[cfg(test)]
mod ep_loss_tests {
    use super::*;

    fn anchor() -> Vec<f32> { vec![0.5, -0.3, 0.8] }
    fn positive() -> Vec<f32> { vec![0.4, 0.1, 0.6] }
    fn negatives() -> Vec<Vec<f32>> {
        vec![vec![-0.2, 0.9, 0.1], vec![0.7, -0.5, -0.4]]
    }

    fn all_losses() -> Vec<Loss> {
        vec![
            Loss::MarginLoss { margin: 1., negatives: 2 },
            Loss::StarSpace { margin: 1., negatives: 2 },
            Loss::RankLoss { tau: 0.9, negatives: 2 },
            Loss::RankSpace { tau: 0.9, negatives: 2 },
            Loss::PPR { margin: 1., num: 2, restart_p: 0.5 },
            Loss::Contrastive { pos_margin: 0.9, neg_margin: 0.1, negatives: 2 }
        ]
    }

    #[test]
    fn test_cosine() {
        let sim = Similarity::Cosine;
        let (s, _, _) = sim.forward_backward(&[1., 3.], &[1., 3.]);
        assert!((s - 1.).abs() < 1e-6);
        assert!((sim.compute(&[1., 0.], &[0., 2.])).abs() < 1e-6);

        // Zero vectors stay finite
        let (s, da, db) = sim.forward_backward(&[0., 0.], &[1., 2.]);
        assert_eq!(s, 0.);
        assert!(all_finite(&da) && all_finite(&db));
    }

    #[test]
    fn test_non_negative() {
        for loss in all_losses() {
            for sim in [Similarity::Cosine, Similarity::Dot] {
                let out = loss.compute(sim, &anchor(), &positive(), &negatives());
                assert!(out.loss >= 0., "{:?} {:?}: {}", loss, sim, out.loss);
                assert!(out.is_finite());
            }
        }
    }

    #[test]
    fn test_zero_when_margin_satisfied() {
        let a = anchor();
        let negs: Vec<_> = vec![a.iter().map(|x| -x).collect(), a.iter().map(|x| -x).collect()];
        let margins = vec![
            Loss::MarginLoss { margin: 1., negatives: 2 },
            Loss::StarSpace { margin: 1., negatives: 2 },
            Loss::PPR { margin: 1., num: 2, restart_p: 0.5 },
            Loss::Contrastive { pos_margin: 0.9, neg_margin: 0., negatives: 2 }
        ];
        for loss in margins {
            let out = loss.compute(Similarity::Cosine, &a, &a, &negs);
            assert_eq!(out.loss, 0., "{:?}", loss);
            assert!(out.d_anchor.iter().all(|g| *g == 0.));
        }
    }

    #[test]
    fn test_rank_threshold() {
        let a = anchor();
        let negs: Vec<_> = vec![a.iter().map(|x| -x).collect()];
        // Positive already dominates the softmax
        let out = Loss::RankLoss { tau: 0.5, negatives: 1 }
            .compute(Similarity::Dot, &a, &a, &negs);
        assert_eq!(out.loss, 0.);

        // No negatives means the positive has all the mass
        let out = Loss::RankLoss { tau: 1., negatives: 0 }
            .compute(Similarity::Dot, &a, &positive(), &[]);
        assert_eq!(out.loss, 0.);
    }

    #[test]
    fn test_starspace_uses_hardest() {
        let out = Loss::StarSpace { margin: 10., negatives: 2 }
            .compute(Similarity::Cosine, &anchor(), &positive(), &negatives());

        // Second negative is closer to the anchor
        assert!(out.d_negatives[0].iter().all(|g| *g == 0.));
        assert!(out.d_negatives[1].iter().any(|g| *g != 0.));
    }

    fn numeric_check(loss: Loss, sim: Similarity) {
        let eps = 1e-3;
        let a = anchor();
        let p = positive();
        let n = negatives();
        let out = loss.compute(sim, &a, &p, &n);
        let f = |a: &[f32], p: &[f32], n: &[Vec<f32>]| loss.compute(sim, a, p, n).loss;

        for d in 0..a.len() {
            let mut ap = a.clone(); ap[d] += eps;
            let mut am = a.clone(); am[d] -= eps;
            let numeric = (f(&ap, &p, &n) - f(&am, &p, &n)) / (2. * eps);
            assert!((numeric - out.d_anchor[d]).abs() < 1e-2, "{:?} anchor {}: {} vs {}", loss, d, numeric, out.d_anchor[d]);

            let mut pp = p.clone(); pp[d] += eps;
            let mut pm = p.clone(); pm[d] -= eps;
            let numeric = (f(&a, &pp, &n) - f(&a, &pm, &n)) / (2. * eps);
            assert!((numeric - out.d_positive[d]).abs() < 1e-2, "{:?} positive {}: {} vs {}", loss, d, numeric, out.d_positive[d]);

            for i in 0..n.len() {
                let mut np = n.clone(); np[i][d] += eps;
                let mut nm = n.clone(); nm[i][d] -= eps;
                let numeric = (f(&a, &p, &np) - f(&a, &p, &nm)) / (2. * eps);
                assert!((numeric - out.d_negatives[i][d]).abs() < 1e-2, "{:?} neg {} {}: {} vs {}", loss, i, d, numeric, out.d_negatives[i][d]);
            }
        }
    }

    #[test]
    fn test_gradients() {
        // Margins are wide enough that every hinge is active
        let losses = vec![
            Loss::MarginLoss { margin: 10., negatives: 2 },
            Loss::StarSpace { margin: 10., negatives: 2 },
            Loss::RankLoss { tau: 1.1, negatives: 2 },
            Loss::RankSpace { tau: 10., negatives: 2 },
            Loss::Contrastive { pos_margin: 10., neg_margin: -10., negatives: 2 }
        ];
        for loss in losses {
            numeric_check(loss, Similarity::Cosine);
            numeric_check(loss, Similarity::Dot);
        }
    }

    #[test]
    fn test_from_objectives() {
        let mut opts = ObjectiveOptions::default();
        assert!(matches!(Loss::from_objectives(&opts), Err(Error::ObjectiveSelection(0))));

        opts.margin = Some((1., 5));
        assert_eq!(Loss::from_objectives(&opts).unwrap(), Loss::MarginLoss { margin: 1., negatives: 5 });

        opts.contrastive = Some((0.9, 0.1, 3));
        assert!(matches!(Loss::from_objectives(&opts), Err(Error::ObjectiveSelection(2))));

        let opts = ObjectiveOptions { ppr: Some((1., 0, 0.5)), ..Default::default() };
        assert!(matches!(Loss::from_objectives(&opts), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_loss_weighting() {
        assert_eq!(LossWeighting::parse(&["none"]).unwrap(), LossWeighting::None);
        assert_eq!(LossWeighting::parse(&["log"]).unwrap(), LossWeighting::Log);
        assert_eq!(LossWeighting::parse(&["exponential", "0.5"]).unwrap(), LossWeighting::Exponential(0.5));
        assert!(matches!(LossWeighting::parse(&["sqrt"]), Err(Error::UnknownLossWeighting(k)) if k == "sqrt"));
        assert!(LossWeighting::parse(&["exponential"]).is_err());

        assert_eq!(LossWeighting::None.weight(100), 1.);
        assert!((LossWeighting::Log.weight(1) - 2f32.ln()).abs() < 1e-6);
        assert!((LossWeighting::Exponential(0.5).weight(16) - 4.).abs() < 1e-6);
    }

    #[test]
    fn test_serde() {
        let loss = Loss::Contrastive { pos_margin: 0.9, neg_margin: 0.1, negatives: 3 };
        let json = serde_json::to_string(&loss).unwrap();
        assert_eq!(serde_json::from_str::<Loss>(&json).unwrap(), loss);
    }
}
