use tch::{Device, Tensor};

/// Selects the device to run on, preferring accelerators when available
/// unless the caller forces the CPU.
pub fn device_setup(cpu: bool) -> Device {
    if cpu {
        Device::Cpu
    } else if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

/// Appends trailing singleton dimensions until `xs` has `target_dims`
/// dimensions, so a per-example quantity broadcasts over time and features.
pub(crate) fn append_dims(xs: &Tensor, target_dims: usize) -> Tensor {
    let mut shape = xs.size();
    shape.extend(std::iter::repeat(1).take(target_dims.saturating_sub(xs.dim())));
    xs.reshape(shape.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn append_dims_broadcasts_per_example_sigma() {
        let sigma = Tensor::from_slice(&[1f32, 2., 3.]);
        let expanded = append_dims(&sigma, 3);
        assert_eq!(expanded.size(), vec![3, 1, 1]);
        let x = Tensor::ones([3, 4, 5], (Kind::Float, Device::Cpu));
        assert_eq!((x * expanded).size(), vec![3, 4, 5]);
    }
}
