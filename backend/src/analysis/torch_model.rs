use std::sync::Mutex;

use ndarray::Array4;
use tch::{CModule, Device, Kind, Tensor};

use super::AnalysisError;
use super::classifier::DiseaseModel;

/// TorchScript export of the disease classifier.
pub struct TorchModel {
    module: Mutex<CModule>,
    device: Device,
    input_size: (u32, u32),
    outputs_logits: bool,
}

impl TorchModel {
    pub fn load(
        model_path: &str,
        input_size: u32,
        outputs_logits: bool,
    ) -> Result<Self, AnalysisError> {
        let device = Device::cuda_if_available();
        let module = CModule::load_on_device(model_path, device)
            .map_err(|e| AnalysisError::ModelLoad(format!("{}: {}", model_path, e)))?;
        log::info!("Loaded disease model {} on {:?}", model_path, device);
        Ok(Self {
            module: Mutex::new(module),
            device,
            input_size: (input_size, input_size),
            outputs_logits,
        })
    }
}

impl DiseaseModel for TorchModel {
    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn predict(&self, input: Array4<f32>) -> Result<Vec<f32>, AnalysisError> {
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_slice(&data)
            .view(shape.as_slice())
            .permute([0, 3, 1, 2])
            .to_device(self.device);

        let module = self
            .module
            .lock()
            .map_err(|_| AnalysisError::Inference("model lock poisoned".to_string()))?;
        let output = module
            .forward_ts(&[tensor])
            .map_err(|e| AnalysisError::Inference(e.to_string()))?;
        let output = if self.outputs_logits {
            output.softmax(-1, Kind::Float)
        } else {
            output
        };

        let output_flat = output.to_kind(Kind::Float).to_device(Device::Cpu).view([-1]);
        let num_elements = output_flat.size()[0] as usize;
        let mut output_vec = vec![0.0f32; num_elements];
        output_flat.copy_data(&mut output_vec, num_elements);
        Ok(output_vec)
    }
}
