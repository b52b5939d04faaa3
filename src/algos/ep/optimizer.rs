//! Defines the actual gradient optimizers for SGD.
//! Nothing particularly special about these, just canonical versions of the ones used in practice.
use hashbrown::HashMap;
use rayon::prelude::*;

use crate::distance::Distance;
use crate::embeddings::EmbeddingStore;

/// Optimizer trait.  We provide it the table, the gradient maps, and a few other details
/// (such as alpha==learning rate), and it optimizes.  `t` counts the updates applied so far.
pub trait Optimizer: Send + Sync {
    fn update(
        &self,
        embeddings: &EmbeddingStore,
        grads: HashMap<usize, Vec<f32>>,
        alpha: f32,
        t: f32
    );
}

/// Adam Optimizer.  Moment tables are updated hogwild style like the embeddings themselves.
pub struct AdamOptimizer {
    beta_1: f32,
    beta_2: f32,
    eps: f32,
    mom: EmbeddingStore,
    var: EmbeddingStore
}

impl AdamOptimizer {
    pub fn new(beta_1: f32, beta_2: f32, dims: usize, length: usize) -> Self {
        let mom = EmbeddingStore::new(length, dims, Distance::Cosine);
        let var = EmbeddingStore::new(length, dims, Distance::Cosine);
        AdamOptimizer { beta_1, beta_2, mom, var, eps: 1e-8 }
    }
}

impl Optimizer for AdamOptimizer {

    fn update(
        &self,
        embeddings: &EmbeddingStore,
        grads: HashMap<usize, Vec<f32>>,
        alpha: f32,
        t: f32
    ) {
        let t = t + 1.;
        let bias_1 = 1. - self.beta_1.powf(t);
        let bias_2 = 1. - self.beta_2.powf(t);
        grads.into_par_iter().for_each(|(id, grad)| {
            let dims = grad.len();
            let mut mom = vec![0f32; dims];
            let mut var = vec![0f32; dims];
            self.mom.read_into(id, &mut mom);
            self.var.read_into(id, &mut var);

            // Update first order mean
            mom.iter_mut().zip(grad.iter()).for_each(|(m_i, g_i)| {
                *m_i = self.beta_1 * *m_i + (1. - self.beta_1) * g_i;
            });

            // Update secord order variance
            var.iter_mut().zip(grad.iter()).for_each(|(v_i, g_i)| {
                *v_i = self.beta_2 * *v_i + (1. - self.beta_2) * g_i.powf(2.);
            });

            self.mom.set_embedding(id, &mom);
            self.var.set_embedding(id, &var);

            let delta: Vec<_> = mom.iter().zip(var.iter()).map(|(m_i, v_i)| {
                let m_i = m_i / bias_1;
                let v_i = v_i / bias_2;
                -alpha * m_i / (v_i.sqrt() + self.eps)
            }).collect();

            embeddings.apply_gradient(id, &delta);
        });
    }
}
