//! Quantization handlers and the ordered registry that selects between them.

use crate::core::op::{FusionKind, Op, PoolKind};
use crate::core::types::DType;
use crate::error::{Error, Result};
use crate::graph::Node;
use crate::quantization::concat::reconcile;
use crate::quantization::qrec::QRec;
use crate::quantization::qtype::{QScheme, QType, Scale};
use crate::quantization::stats::{NodeStats, Range};
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// A boolean option a handler reads, with its default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionSpec {
    pub name: &'static str,
    pub default: bool,
    pub help: &'static str,
}

pub const ALLOW_ASYMMETRIC: OptionSpec = OptionSpec {
    name: "allow_asymmetric",
    default: false,
    help: "allow software kernels to use asymmetric formats where possible",
};

pub const USE_NE16: OptionSpec = OptionSpec {
    name: "use_ne16",
    default: false,
    help: "run eligible layers on the NE16 accelerator",
};

/// Static description used to pick candidate handlers.
#[derive(Debug, Clone, Copy)]
pub struct HandlerSpec {
    pub name: &'static str,
    pub scheme: QScheme,
    pub matches: fn(&Op) -> bool,
    /// Allowed dtypes of forced inputs.
    pub in_dtypes: Option<&'static [DType]>,
    /// Allowed dtypes of forced outputs.
    pub out_dtypes: Option<&'static [DType]>,
    pub priority: i32,
    pub options: &'static [OptionSpec],
}

impl HandlerSpec {
    fn new(name: &'static str, scheme: QScheme, matches: fn(&Op) -> bool) -> Self {
        Self { name, scheme, matches, in_dtypes: None, out_dtypes: None, priority: 0, options: &[] }
    }

    fn accepts(&self, op: &Op, scheme: QScheme, in_qs: &[QType], force_out: &[Option<QType>]) -> bool {
        if self.scheme != scheme || !(self.matches)(op) {
            return false;
        }
        let allowed = |set: Option<&[DType]>, q: &QType| set.is_none_or(|set| set.contains(&q.dtype));
        in_qs.iter().filter(|q| q.forced).all(|q| allowed(self.in_dtypes, q))
            && force_out.iter().flatten().all(|q| allowed(self.out_dtypes, q))
    }
}

/// Resolved option values for one node: node override, then global override, then declared default.
#[derive(Debug, Clone, Copy)]
pub struct Options<'a> {
    pub node: Option<&'a BTreeMap<String, bool>>,
    pub global: &'a BTreeMap<String, bool>,
}

impl Options<'_> {
    pub fn get(&self, spec: &OptionSpec) -> bool {
        self.node
            .and_then(|opts| opts.get(spec.name))
            .or_else(|| self.global.get(spec.name))
            .copied()
            .unwrap_or(spec.default)
    }
}

/// Everything a handler may look at when quantizing one node.
pub struct QuantizeRequest<'a> {
    pub node: &'a Node,
    pub in_qs: &'a [QType],
    /// One slot per output; `Some` when that output's format is forced.
    pub force_out: &'a [Option<QType>],
    pub stats: Option<&'a NodeStats>,
    pub existing: Option<&'a QRec>,
    pub backwards: bool,
    pub default_dtype: DType,
    pub options: Options<'a>,
}

impl QuantizeRequest<'_> {
    pub fn forced_out(&self, idx: usize) -> Option<&QType> {
        self.force_out.get(idx).and_then(Option::as_ref)
    }

    pub fn option(&self, spec: &OptionSpec) -> bool {
        self.options.get(spec)
    }

    pub fn out_range(&self, idx: usize) -> Result<Range> {
        self.stats
            .and_then(|s| s.range_out.get(idx))
            .copied()
            .ok_or_else(|| Error::MissingStatistics { node: self.node.name.clone() })
    }

    fn first_in(&self) -> Result<&QType> {
        self.in_qs
            .first()
            .ok_or_else(|| Error::InvariantViolation(format!("{} has no input format", self.node.name)))
    }

    /// Forced output format, or one derived from the calibrated output range.
    fn out_q(&self, scheme: QScheme, idx: usize, asymmetric: bool) -> Result<QType> {
        match self.forced_out(idx) {
            Some(q) => Ok(q.clone()),
            None => Ok(QType::from_range(scheme, self.default_dtype, self.out_range(idx)?, asymmetric)),
        }
    }
}

pub trait QuantizeHandler {
    fn spec(&self) -> HandlerSpec;

    /// `Ok(None)` rejects the node so the next candidate can try.
    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>>;
}

/// Handlers in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn QuantizeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: QuantizeHandler + 'static>(&mut self, handler: H) -> &mut Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Every built-in handler for both schemes.
    pub fn standard() -> Self {
        let mut reg = Self::new();
        for scheme in [QScheme::Scaled, QScheme::Pow2] {
            reg.register(InputHandler { scheme })
                .register(OutputHandler { scheme })
                .register(ConstantHandler { scheme })
                .register(FilterHandler { scheme })
                .register(ActivationHandler { scheme })
                .register(PoolingHandler { scheme })
                .register(ElementwiseHandler { scheme })
                .register(ConcatHandler { scheme })
                .register(SplitHandler { scheme })
                .register(PassThroughHandler { scheme })
                .register(QuantizeOpHandler { scheme })
                .register(FusionHandler { scheme });
        }
        reg.register(Ne16PoolingHandler).register(ExpressionHandler);
        reg
    }

    /// Applicable handlers, highest priority first, ties in registration order.
    pub fn candidates(
        &self,
        op: &Op,
        scheme: QScheme,
        in_qs: &[QType],
        force_out: &[Option<QType>],
    ) -> Vec<(HandlerSpec, &dyn QuantizeHandler)> {
        let mut found: Vec<_> = self
            .handlers
            .iter()
            .map(|h| (h.spec(), h.as_ref()))
            .filter(|(spec, _)| spec.accepts(op, scheme, in_qs, force_out))
            .collect();
        found.sort_by_key(|(spec, _)| Reverse(spec.priority));
        found
    }

    /// Options declared by any registered handler.
    pub fn declared_options(&self) -> BTreeMap<&'static str, OptionSpec> {
        self.handlers.iter().flat_map(|h| h.spec().options.iter().map(|o| (o.name, *o))).collect()
    }
}

fn weights_q(scheme: QScheme, weights: &QType) -> QType {
    if weights.forced {
        return weights.clone();
    }
    match scheme {
        QScheme::Scaled => QType::scaled(DType::Int8, weights.min, weights.max, false),
        QScheme::Pow2 => QType::pow2(DType::Int8, weights.min, weights.max),
    }
}

fn bias_q(scheme: QScheme, in_q: &QType, w_q: &QType, bias: &QType) -> Option<QType> {
    let q = match (scheme, in_q.scale, w_q.scale) {
        (QScheme::Pow2, Scale::Shift(iq), Scale::Shift(wq)) => QType::pow2_q(DType::Int32, iq + wq),
        _ => QType {
            dtype: DType::Int32,
            scale: Scale::Factor(in_q.scale_factor() * w_q.scale_factor()),
            zero_point: 0,
            min: bias.min,
            max: bias.max,
            forced: false,
        },
    };
    if bias.forced && *bias != q {
        return None;
    }
    Some(q)
}

/// Input, weights and bias formats of a filter.
fn filter_in_qs(scheme: QScheme, req: &QuantizeRequest<'_>) -> Result<Option<Vec<QType>>> {
    let [in_q, weights, bias] = req.in_qs else {
        return Err(Error::InvariantViolation(format!("filter {} needs input, weights and bias", req.node.name)));
    };
    let mut in_q = in_q.clone();
    if in_q.is_asymmetric() {
        if in_q.forced {
            return Ok(None);
        }
        in_q = in_q.symmetric();
    }
    let w_q = weights_q(scheme, weights);
    let Some(b_q) = bias_q(scheme, &in_q, &w_q, bias) else { return Ok(None) };
    Ok(Some(vec![in_q, w_q, b_q]))
}

/// Single-input ops whose output shares the input format.
fn pass_through(scheme: QScheme, req: &QuantizeRequest<'_>, outputs: usize) -> Result<Option<QRec>> {
    let mut in_q = req.first_in()?.clone();
    let forced: Vec<&QType> = req.force_out.iter().flatten().collect();
    if let Some(first) = forced.first() {
        if forced.iter().any(|q| q != first) || (in_q.forced && in_q != **first) {
            return Ok(None);
        }
        in_q = (*first).clone();
    }
    let out = in_q.clone().unforced();
    Ok(Some(QRec::new(scheme, vec![in_q], vec![out; outputs])))
}

pub struct InputHandler {
    pub scheme: QScheme,
}

impl QuantizeHandler for InputHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec::new("input", self.scheme, |op| matches!(op, Op::Input { .. }))
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        let out = req.out_q(self.scheme, 0, false)?;
        Ok(Some(QRec::new(self.scheme, vec![], vec![out])))
    }
}

pub struct OutputHandler {
    pub scheme: QScheme,
}

impl QuantizeHandler for OutputHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec::new("output", self.scheme, |op| matches!(op, Op::Output { .. }))
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        Ok(Some(QRec::new(self.scheme, req.in_qs.to_vec(), vec![])))
    }
}

pub struct ConstantHandler {
    pub scheme: QScheme,
}

impl QuantizeHandler for ConstantHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec::new("constant", self.scheme, Op::is_constant)
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        let out = match (req.forced_out(0), &req.node.op) {
            (Some(q), _) => q.clone(),
            (None, Op::Constant { value }) => {
                let range = Range::new(value.min() as f64, value.max() as f64);
                QType::from_range(self.scheme, req.default_dtype, range, false)
            }
            _ => return Ok(None),
        };
        Ok(Some(QRec::new(self.scheme, vec![], vec![out])))
    }
}

pub struct FilterHandler {
    pub scheme: QScheme,
}

impl QuantizeHandler for FilterHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec::new("filter", self.scheme, |op| matches!(op, Op::Conv2d(_) | Op::Linear(_)))
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        let Some(in_qs) = filter_in_qs(self.scheme, req)? else { return Ok(None) };
        let out = req.out_q(self.scheme, 0, false)?;
        Ok(Some(QRec::new(self.scheme, in_qs, vec![out])))
    }
}

pub struct ActivationHandler {
    pub scheme: QScheme,
}

impl QuantizeHandler for ActivationHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec::new("activation", self.scheme, |op| matches!(op, Op::Activation { .. }))
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        use crate::core::op::ActivationKind::*;
        let keeps_format = matches!(req.node.op, Op::Activation { kind: Relu | Relu6 | LeakyRelu });
        if self.scheme == QScheme::Pow2 && keeps_format {
            return pass_through(self.scheme, req, 1);
        }
        let in_q = req.first_in()?.clone();
        let out = req.out_q(self.scheme, 0, false)?;
        Ok(Some(QRec::new(self.scheme, vec![in_q], vec![out])))
    }
}

/// Software pooling. Output shares the input format unless forced.
pub struct PoolingHandler {
    pub scheme: QScheme,
}

impl QuantizeHandler for PoolingHandler {
    fn spec(&self) -> HandlerSpec {
        let mut spec = HandlerSpec::new("pooling", self.scheme, |op| matches!(op, Op::Pool(_) | Op::GlobalPool { .. }));
        if self.scheme == QScheme::Scaled {
            spec.in_dtypes = Some(&[DType::Int8]);
            spec.out_dtypes = Some(&[DType::Int8]);
            spec.options = &[ALLOW_ASYMMETRIC];
        }
        spec
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        if self.scheme == QScheme::Pow2 {
            return pass_through(self.scheme, req, 1);
        }
        let allow_asymmetric = req.option(&ALLOW_ASYMMETRIC);
        let padded = matches!(&req.node.op, Op::Pool(p) if p.padding);
        let mut in_q = req.first_in()?.clone();
        if in_q.is_asymmetric() && (!allow_asymmetric || padded) {
            if in_q.forced {
                return Ok(None);
            }
            in_q = in_q.symmetric();
        }
        let out = match req.forced_out(0) {
            Some(o) => {
                if o.dtype != in_q.dtype || o.zero_point != in_q.zero_point {
                    if in_q.forced || (!allow_asymmetric && o.zero_point != 0) {
                        return Ok(None);
                    }
                    in_q = o.clone();
                }
                tracing::warn!(node = %req.node.name, min = o.min, max = o.max, "pooling output forced");
                o.clone()
            }
            None => in_q.clone().unforced(),
        };
        Ok(Some(QRec::new(self.scheme, vec![in_q], vec![out])))
    }
}

/// Max pooling on the NE16 accelerator, which works on unsigned data.
pub struct Ne16PoolingHandler;

impl QuantizeHandler for Ne16PoolingHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec {
            in_dtypes: Some(&[DType::UInt8]),
            out_dtypes: Some(&[DType::UInt8]),
            priority: 2,
            options: &[USE_NE16],
            ..HandlerSpec::new("ne16_pooling", QScheme::Scaled, |op| {
                matches!(op, Op::Pool(p) if p.kind == PoolKind::Max)
            })
        }
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        let mut in_q = req.first_in()?.clone();
        if in_q.dtype != DType::UInt8 {
            if in_q.forced || !req.option(&USE_NE16) {
                return Ok(None);
            }
            in_q = QType::scaled(DType::UInt8, in_q.min, in_q.max, true);
        }
        let out = match req.forced_out(0) {
            Some(o) => {
                if in_q.forced && in_q.zero_point != o.zero_point {
                    return Ok(None);
                }
                in_q = o.clone();
                o.clone()
            }
            None => in_q.clone().unforced(),
        };
        let mut qrec = QRec::new(QScheme::Scaled, vec![in_q], vec![out]);
        qrec.ne16 = true;
        Ok(Some(qrec))
    }
}

pub struct ElementwiseHandler {
    pub scheme: QScheme,
}

impl QuantizeHandler for ElementwiseHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec::new("elementwise", self.scheme, |op| {
            matches!(op, Op::MatAdd | Op::MatSub | Op::MatMul | Op::MatDiv)
        })
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        let aligned = self.scheme == QScheme::Pow2 && matches!(req.node.op, Op::MatAdd | Op::MatSub);
        let in_qs = if aligned {
            match reconcile(&req.node.name, req.in_qs, None, false)? {
                Some(res) => res.in_qs,
                None => return Ok(None),
            }
        } else {
            req.in_qs.to_vec()
        };
        let out = req.out_q(self.scheme, 0, false)?;
        Ok(Some(QRec::new(self.scheme, in_qs, vec![out])))
    }
}

pub struct ConcatHandler {
    pub scheme: QScheme,
}

impl QuantizeHandler for ConcatHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec::new("concat", self.scheme, |op| matches!(op, Op::Concat { .. }))
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        Ok(reconcile(&req.node.name, req.in_qs, req.forced_out(0), req.backwards)?
            .map(|res| QRec::new(self.scheme, res.in_qs, vec![res.out_q])))
    }
}

pub struct SplitHandler {
    pub scheme: QScheme,
}

impl QuantizeHandler for SplitHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec::new("split", self.scheme, |op| matches!(op, Op::Split { .. }))
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        pass_through(self.scheme, req, req.node.op.out_arity())
    }
}

/// Reshape and transpose only move data.
pub struct PassThroughHandler {
    pub scheme: QScheme,
}

impl QuantizeHandler for PassThroughHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec::new("pass_through", self.scheme, |op| matches!(op, Op::Reshape { .. } | Op::Transpose { .. }))
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        pass_through(self.scheme, req, 1)
    }
}

pub struct QuantizeOpHandler {
    pub scheme: QScheme,
}

impl QuantizeHandler for QuantizeOpHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec::new("quantize", self.scheme, |op| matches!(op, Op::Quantize { .. }))
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        let Op::Quantize { to } = req.node.op else { return Ok(None) };
        let in_q = req.first_in()?.clone();
        let out = match req.forced_out(0) {
            Some(q) => q.clone(),
            None => QType::from_range(self.scheme, to, in_q.range(), !to.is_signed()),
        };
        Ok(Some(QRec::new(self.scheme, vec![in_q], vec![out])))
    }
}

/// Filter/op + activation fusions.
pub struct FusionHandler {
    pub scheme: QScheme,
}

impl QuantizeHandler for FusionHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec::new("fusion", self.scheme, |op| {
            op.fusion().is_some_and(|f| f.kind != FusionKind::Expression)
        })
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        let is_filter = req.node.op.capabilities().is_filter;
        let in_qs = if is_filter {
            match filter_in_qs(self.scheme, req)? {
                Some(in_qs) => in_qs,
                None => return Ok(None),
            }
        } else {
            req.in_qs.to_vec()
        };
        let out = req.out_q(self.scheme, 0, false)?;
        Ok(Some(QRec::new(self.scheme, in_qs, vec![out])))
    }
}

/// Fused expressions take their output range from the expression's recorded bounds.
pub struct ExpressionHandler;

impl QuantizeHandler for ExpressionHandler {
    fn spec(&self) -> HandlerSpec {
        HandlerSpec::new("expression", QScheme::Scaled, |op| {
            op.fusion().is_some_and(|f| f.kind == FusionKind::Expression)
        })
    }

    fn quantize(&self, req: &QuantizeRequest<'_>) -> Result<Option<QRec>> {
        let bounds = req.existing.map(|q| q.expression.clone()).unwrap_or_default();
        let out_qs = (0..req.node.op.out_arity())
            .map(|idx| {
                if let Some(q) = req.forced_out(idx) {
                    return Ok(q.clone());
                }
                let range = match bounds.get(&format!("output_{idx}")) {
                    Some(range) => *range,
                    None => req.out_range(idx)?,
                };
                Ok(QType::scaled(req.default_dtype, range.min, range.max, false))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut qrec = QRec::new(QScheme::Scaled, req.in_qs.to_vec(), out_qs);
        qrec.expression = bounds;
        Ok(Some(qrec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::op::PoolParams;
    use crate::core::types::Shape;

    fn max_pool() -> Node {
        Node::new(
            "pool",
            Op::Pool(PoolParams { kind: PoolKind::Max, kernel: [2, 2], stride: [2, 2], padding: false }),
            vec![Shape::new([1, 4, 4])],
        )
    }

    fn run(node: &Node, in_qs: &[QType], options: &BTreeMap<String, bool>) -> QRec {
        let reg = HandlerRegistry::standard();
        let force_out = vec![None];
        let empty = BTreeMap::new();
        for (_, handler) in reg.candidates(&node.op, QScheme::Scaled, in_qs, &force_out) {
            let req = QuantizeRequest {
                node,
                in_qs,
                force_out: &force_out,
                stats: None,
                existing: None,
                backwards: false,
                default_dtype: DType::Int8,
                options: Options { node: Some(options), global: &empty },
            };
            if let Some(qrec) = handler.quantize(&req).unwrap() {
                return qrec;
            }
        }
        panic!("no handler accepted {}", node.name);
    }

    #[test]
    fn higher_priority_handler_comes_first() {
        let reg = HandlerRegistry::standard();
        let names: Vec<_> = reg
            .candidates(&max_pool().op, QScheme::Scaled, &[], &[None])
            .into_iter()
            .map(|(spec, _)| spec.name)
            .collect();
        assert_eq!(names, vec!["ne16_pooling", "pooling"]);
    }

    #[test]
    fn rejected_handler_falls_through_to_the_next() {
        let in_q = QType::scaled(DType::Int8, -1.0, 1.0, false);
        let qrec = run(&max_pool(), &[in_q.clone()], &BTreeMap::new());
        assert!(!qrec.ne16);
        assert_eq!(qrec.out_qs[0], in_q);
    }

    #[test]
    fn ne16_option_selects_the_accelerator_handler() {
        let in_q = QType::scaled(DType::Int8, 0.0, 1.0, false);
        let opts = BTreeMap::from([("use_ne16".to_string(), true)]);
        let qrec = run(&max_pool(), &[in_q], &opts);
        assert!(qrec.ne16);
        assert_eq!(qrec.in_qs[0].dtype, DType::UInt8);
    }

    #[test]
    fn forced_dtype_outside_the_constraint_excludes_the_handler() {
        let forced = QType::scaled(DType::Int16, -1.0, 1.0, false).forced();
        let reg = HandlerRegistry::standard();
        let names: Vec<_> = reg
            .candidates(&max_pool().op, QScheme::Scaled, &[forced], &[None])
            .into_iter()
            .map(|(spec, _)| spec.name)
            .collect();
        assert!(names.is_empty());
    }

    #[test]
    fn node_option_overrides_global_and_default() {
        let global = BTreeMap::from([("allow_asymmetric".to_string(), true)]);
        let node = BTreeMap::from([("allow_asymmetric".to_string(), false)]);
        assert!(Options { node: None, global: &global }.get(&ALLOW_ASYMMETRIC));
        assert!(!Options { node: Some(&node), global: &global }.get(&ALLOW_ASYMMETRIC));
        assert!(!Options { node: None, global: &BTreeMap::new() }.get(&ALLOW_ASYMMETRIC));
    }

    #[test]
    fn standard_registry_declares_its_options() {
        let options = HandlerRegistry::standard().declared_options();
        assert_eq!(options.keys().copied().collect::<Vec<_>>(), vec!["allow_asymmetric", "use_ne16"]);
        assert!(options.values().all(|o| !o.help.is_empty() && !o.default));
    }
}
