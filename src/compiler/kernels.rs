//! Reference kernels
//!
//! Plain row-major loops. Both the delegated and the portable executor run
//! these; the placement only decides which executor is credited.

use super::graph::Op;
use crate::tensor::Tensor;
use crate::{Error, Result};

/// Kernel entry point: operands in operator order.
pub type KernelFn = fn(&Op, &[&Tensor]) -> Result<Tensor>;

/// Kernel registry entries: operator name and implementation.
pub const KERNELS: &[(&str, KernelFn)] = &[
    ("conv2d", conv2d),
    ("linear", linear),
    ("relu", relu),
    ("relu6", relu6),
    ("add", add),
    ("global_avg_pool", global_avg_pool),
    ("flatten", flatten),
    ("softmax", softmax),
];

/// Bind exactly `N` operands or fail with a runtime error.
fn operands<'a, const N: usize>(op: &Op, args: &[&'a Tensor]) -> Result<[&'a Tensor; N]> {
    <[&Tensor; N]>::try_from(args).map_err(|_| {
        Error::Runtime(format!("{} takes {N} operands, got {}", op.name(), args.len()))
    })
}

fn conv2d(op: &Op, args: &[&Tensor]) -> Result<Tensor> {
    let Op::Conv2d { stride, padding } = *op else {
        return Err(Error::Runtime(format!("conv2d kernel invoked for {op}")));
    };
    let [x, w, b] = operands::<3>(op, args)?;
    let out_spec = op
        .infer(&[&x.spec(), &w.spec(), &b.spec()])
        .map_err(Error::Runtime)?;
    let &[n, c, h, wd] = x.shape() else { unreachable!("checked by infer") };
    let &[o, _, kh, kw] = w.shape() else { unreachable!("checked by infer") };
    let &[_, _, oh, ow] = out_spec.shape() else { unreachable!("checked by infer") };

    let (xd, wdta, bd) = (x.data(), w.data(), b.data());
    let mut out = vec![0.0_f32; n * o * oh * ow];
    for ni in 0..n {
        for oc in 0..o {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = bd[oc];
                    for ic in 0..c {
                        for ky in 0..kh {
                            let iy = (oy * stride + ky).wrapping_sub(padding);
                            if iy >= h {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (ox * stride + kx).wrapping_sub(padding);
                                if ix >= wd {
                                    continue;
                                }
                                let xv = xd[((ni * c + ic) * h + iy) * wd + ix];
                                let wv = wdta[((oc * c + ic) * kh + ky) * kw + kx];
                                acc += xv * wv;
                            }
                        }
                    }
                    out[((ni * o + oc) * oh + oy) * ow + ox] = acc;
                }
            }
        }
    }
    Tensor::new(out_spec.shape(), out)
}

fn linear(op: &Op, args: &[&Tensor]) -> Result<Tensor> {
    let [x, w, b] = operands::<3>(op, args)?;
    let out_spec = op
        .infer(&[&x.spec(), &w.spec(), &b.spec()])
        .map_err(Error::Runtime)?;
    let (n, k) = (x.shape()[0], x.shape()[1]);
    let m = w.shape()[0];
    let mut out = vec![0.0_f32; n * m];
    for row in 0..n {
        let xr = &x.data()[row * k..(row + 1) * k];
        for col in 0..m {
            let wr = &w.data()[col * k..(col + 1) * k];
            let dot = xr.iter().zip(wr).map(|(a, b)| a * b).sum::<f32>();
            out[row * m + col] = b.data()[col] + dot;
        }
    }
    Tensor::new(out_spec.shape(), out)
}

fn map(x: &Tensor, f: impl Fn(f32) -> f32) -> Result<Tensor> {
    Tensor::new(x.shape(), x.data().iter().copied().map(f).collect())
}

fn relu(op: &Op, args: &[&Tensor]) -> Result<Tensor> {
    let [x] = operands::<1>(op, args)?;
    map(x, |v| v.max(0.0))
}

fn relu6(op: &Op, args: &[&Tensor]) -> Result<Tensor> {
    let [x] = operands::<1>(op, args)?;
    map(x, |v| v.clamp(0.0, 6.0))
}

fn add(op: &Op, args: &[&Tensor]) -> Result<Tensor> {
    let [a, b] = operands::<2>(op, args)?;
    op.infer(&[&a.spec(), &b.spec()]).map_err(Error::Runtime)?;
    let data = a.data().iter().zip(b.data()).map(|(x, y)| x + y).collect();
    Tensor::new(a.shape(), data)
}

fn global_avg_pool(op: &Op, args: &[&Tensor]) -> Result<Tensor> {
    let [x] = operands::<1>(op, args)?;
    let out_spec = op.infer(&[&x.spec()]).map_err(Error::Runtime)?;
    let plane = x.shape()[2] * x.shape()[3];
    #[allow(clippy::cast_precision_loss)]
    let denom = plane.max(1) as f32;
    let data = x
        .data()
        .chunks(plane.max(1))
        .map(|chunk| chunk.iter().sum::<f32>() / denom)
        .collect();
    Tensor::new(out_spec.shape(), data)
}

fn flatten(op: &Op, args: &[&Tensor]) -> Result<Tensor> {
    let [x] = operands::<1>(op, args)?;
    let out_spec = op.infer(&[&x.spec()]).map_err(Error::Runtime)?;
    Tensor::new(out_spec.shape(), x.data().to_vec())
}

fn softmax(op: &Op, args: &[&Tensor]) -> Result<Tensor> {
    let [x] = operands::<1>(op, args)?;
    op.infer(&[&x.spec()]).map_err(Error::Runtime)?;
    let last = x.shape().last().copied().unwrap_or(1).max(1);
    let mut data = Vec::with_capacity(x.numel());
    for row in x.data().chunks(last) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        data.extend(exps.into_iter().map(|e| e / sum));
    }
    Tensor::new(x.shape(), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv2d_identity_kernel() {
        let x = Tensor::new([1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let w = Tensor::new([1, 1, 1, 1], vec![2.0]).unwrap();
        let b = Tensor::new([1], vec![0.5]).unwrap();
        let y = conv2d(&Op::Conv2d { stride: 1, padding: 0 }, &[&x, &w, &b]).unwrap();
        assert_eq!(y.data(), &[2.5, 4.5, 6.5, 8.5]);
    }

    #[test]
    fn test_conv2d_padding_zeroes_border() {
        let x = Tensor::new([1, 1, 1, 1], vec![1.0]).unwrap();
        let w = Tensor::new([1, 1, 3, 3], vec![1.0; 9]).unwrap();
        let b = Tensor::zeros([1]);
        let y = conv2d(&Op::Conv2d { stride: 1, padding: 1 }, &[&x, &w, &b]).unwrap();
        assert_eq!(y.shape(), &[1, 1, 1, 1]);
        assert_eq!(y.data(), &[1.0]);
    }

    #[test]
    fn test_linear() {
        let x = Tensor::new([1, 2], vec![1.0, 2.0]).unwrap();
        let w = Tensor::new([2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let b = Tensor::new([2], vec![0.5, -0.5]).unwrap();
        let y = linear(&Op::Linear, &[&x, &w, &b]).unwrap();
        assert_eq!(y.data(), &[1.5, 1.5]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = Tensor::new([2, 3], vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0]).unwrap();
        let y = softmax(&Op::Softmax, &[&x]).unwrap();
        for row in y.data().chunks(3) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_global_avg_pool() {
        let x = Tensor::new([1, 2, 1, 2], vec![1.0, 3.0, 10.0, 20.0]).unwrap();
        let y = global_avg_pool(&Op::GlobalAvgPool, &[&x]).unwrap();
        assert_eq!(y.data(), &[2.0, 15.0]);
    }

    #[test]
    fn test_wrong_operand_count_is_an_error() {
        let x = Tensor::zeros([1, 2]);
        assert!(matches!(relu(&Op::Relu, &[]), Err(Error::Runtime(_))));
        assert!(matches!(add(&Op::Add, &[&x]), Err(Error::Runtime(_))));
        assert!(matches!(linear(&Op::Linear, &[&x, &x]), Err(Error::Runtime(_))));
    }

    #[test]
    fn test_registry_covers_every_op() {
        let ops = [
            "conv2d",
            "linear",
            "relu",
            "relu6",
            "add",
            "global_avg_pool",
            "flatten",
            "softmax",
        ];
        for name in ops {
            assert!(KERNELS.iter().any(|(n, _)| *n == name), "missing kernel {name}");
        }
    }
}
