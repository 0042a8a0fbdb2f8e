use std::sync::Arc;

use diffsol::{
    ConstantOp, LinearOp, NonLinearOp, NonLinearOpJacobian, OdeEquations, OdeEquationsRef, Op,
};

use crate::model::CompartmentalModel;

type T = f64;
type V = nalgebra::DVector<f64>;
type M = nalgebra::DMatrix<f64>;

pub struct ModelRhs<'a> {
    nstates: usize,
    nparams: usize,
    model: &'a CompartmentalModel,
    p: &'a [f64],
}

impl Op for ModelRhs<'_> {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl NonLinearOp for ModelRhs<'_> {
    fn call_inplace(&self, x: &Self::V, t: Self::T, y: &mut Self::V) {
        self.model
            .derivatives_into(t, x.as_slice(), self.p, y.as_mut_slice());
    }
}

impl NonLinearOpJacobian for ModelRhs<'_> {
    /// Forward-difference directional derivative `J(x) v`
    fn jac_mul_inplace(&self, x: &Self::V, t: Self::T, v: &Self::V, y: &mut Self::V) {
        let vnorm = v.norm();
        if vnorm == 0.0 {
            y.fill(0.0);
            return;
        }
        let eps = T::EPSILON.sqrt() * (1.0 + x.norm()) / vnorm;
        let shifted = x + v * eps;
        let mut f0 = V::zeros(self.nstates);
        self.call_inplace(x, t, &mut f0);
        self.call_inplace(&shifted, t, y);
        *y -= &f0;
        *y /= eps;
    }
}

pub struct ModelMass {
    nstates: usize,
    nparams: usize,
}

impl Op for ModelMass {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl LinearOp for ModelMass {
    fn gemv_inplace(&self, _x: &Self::V, _t: Self::T, _beta: Self::T, _y: &mut Self::V) {}
}

pub struct ModelInit {
    nstates: usize,
    nparams: usize,
    init: V,
}

impl Op for ModelInit {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl ConstantOp for ModelInit {
    fn call_inplace(&self, _t: Self::T, y: &mut Self::V) {
        y.copy_from(&self.init);
    }
}

pub struct ModelRoot {
    nstates: usize,
    nparams: usize,
}

impl Op for ModelRoot {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        0
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl NonLinearOp for ModelRoot {
    fn call_inplace(&self, _x: &Self::V, _t: Self::T, _y: &mut Self::V) {}
}

pub struct ModelOut {
    nstates: usize,
    nparams: usize,
}

impl Op for ModelOut {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl NonLinearOp for ModelOut {
    fn call_inplace(&self, _x: &Self::V, _t: Self::T, _y: &mut Self::V) {}
}

/// One continuous segment of a task: the shared model, the task's own
/// parameter copy and the state at the segment start
pub struct SegmentProblem {
    model: Arc<CompartmentalModel>,
    nstates: usize,
    nparams: usize,
    p: Vec<f64>,
    init: V,
}

impl SegmentProblem {
    pub fn new(model: Arc<CompartmentalModel>, p: Vec<f64>, init: &[f64]) -> Self {
        Self {
            nstates: model.nstates(),
            nparams: p.len(),
            model,
            p,
            init: V::from_column_slice(init),
        }
    }
}

impl Op for SegmentProblem {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl<'b> OdeEquationsRef<'b> for SegmentProblem {
    type Rhs = ModelRhs<'b>;
    type Mass = ModelMass;
    type Init = ModelInit;
    type Root = ModelRoot;
    type Out = ModelOut;
}

impl OdeEquations for SegmentProblem {
    fn rhs(&self) -> ModelRhs<'_> {
        ModelRhs {
            nstates: self.nstates,
            nparams: self.nparams,
            model: &self.model,
            p: &self.p,
        }
    }

    fn mass(&self) -> Option<ModelMass> {
        None
    }

    fn init(&self) -> ModelInit {
        ModelInit {
            nstates: self.nstates,
            nparams: self.nparams,
            init: self.init.clone(),
        }
    }

    fn get_params(&self, p: &mut V) {
        p.copy_from(&V::from_column_slice(&self.p));
    }

    fn root(&self) -> Option<ModelRoot> {
        None
    }

    fn out(&self) -> Option<ModelOut> {
        None
    }

    fn set_params(&mut self, p: &V) {
        self.p = p.iter().cloned().collect();
    }
}
