//! 推論エンジンの共通インタフェースと，その実装 `InferenceEngine`

use std::path::Path;
use std::time::Instant;

use log::{debug, info};

use crate::binding::{ordered_bindings, Dims, NetworkBinding, Role};
use crate::cache;
use crate::compiler::{BuildOptions, CompiledEngine, EngineCompiler};
use crate::device::{Device, HostDevice};
use crate::error::{EngineError, Result};
use crate::memory_pool::DeviceMemoryPool;
use crate::parser::{ModelFormat, ModelParser};

/// 推論エンジンの共通インタフェース
///
/// バインディングは `load_model` / `load_cache` の前に登録し，読み込み後は変更できない。
pub trait Engine {
    /// 入力バインディングを登録します。
    fn add_input(&mut self, name: &str, dims: Dims, element_size: usize) -> Result<()>;

    /// 出力バインディングを登録します。
    fn add_output(&mut self, name: &str, dims: Dims, element_size: usize) -> Result<()>;

    /// モデル記述と重みからエンジンをビルドします。
    fn load_model(&mut self, model: &Path, weights: &Path, options: &BuildOptions) -> Result<()>;

    /// キャッシュからエンジンを読み込みます。失敗時は回復可能な `CacheLoad` を返す
    fn load_cache(&mut self, path: &Path, max_batch_size: usize) -> Result<()>;

    /// ビルド済みエンジンをキャッシュに保存します。
    fn save_cache(&self, path: &Path) -> Result<()>;

    /// バッチ推論を実行します。
    ///
    /// # Args
    /// * `batch` - サンプルごと，入力バインディングごとのホストバッファ
    ///
    /// # Return
    /// * サンプルごと，出力バインディングごとのホストバッファ
    fn predict(&mut self, batch: &[Vec<Vec<u8>>]) -> Result<Vec<Vec<Vec<u8>>>>;
}

/// モデル形式のアダプタとデバイスを持つ推論エンジン
pub struct InferenceEngine {
    parser: Box<dyn ModelParser>,
    device: Box<dyn Device>,
    inputs: Vec<NetworkBinding>,
    outputs: Vec<NetworkBinding>,
    engine: Option<CompiledEngine>,
    pool: DeviceMemoryPool,
}

impl InferenceEngine {
    /// ホストデバイスで動作する新しい `InferenceEngine` を作成します。
    ///
    /// # Args
    /// * `format` - モデル記述の形式
    pub fn new(format: ModelFormat) -> Self {
        Self::with_device(format, Box::new(HostDevice::new()))
    }

    /// デバイスを指定して新しい `InferenceEngine` を作成します。
    pub fn with_device(format: ModelFormat, device: Box<dyn Device>) -> Self {
        Self {
            parser: format.parser(),
            device,
            inputs: Vec::new(),
            outputs: Vec::new(),
            engine: None,
            pool: DeviceMemoryPool::new(),
        }
    }

    pub fn format(&self) -> ModelFormat {
        self.parser.format()
    }

    /// 登録済みのバインディング (入力 → 出力の順)
    pub fn bindings(&self) -> Vec<NetworkBinding> {
        ordered_bindings(&self.inputs, &self.outputs)
    }

    /// 読み込み済みのエンジン
    pub fn compiled(&self) -> Option<&CompiledEngine> {
        self.engine.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.is_some()
    }

    /// 読み込んだエンジンを外し，バインディングの登録済み状態に戻します。
    ///
    /// デバイスバッファはプールに残り，次のロードで再利用される。
    pub fn unload(&mut self) {
        if self.engine.take().is_some() {
            debug!("engine unloaded");
        }
    }

    pub fn max_batch_size(&self) -> Option<usize> {
        self.engine.as_ref().map(|e| e.max_batch_size())
    }

    pub fn device_mut(&mut self) -> &mut dyn Device {
        self.device.as_mut()
    }

    pub fn pool(&self) -> &DeviceMemoryPool {
        &self.pool
    }

    /// エンジンの概要を返します。
    pub fn summary(&self) -> String {
        match &self.engine {
            Some(engine) => format!("device: {}\n{}", self.device.name(), engine.summary()),
            None => format!("device: {}\nengine: not loaded\n", self.device.name()),
        }
    }

    fn register(&mut self, role: Role, name: &str, dims: Dims, element_size: usize) -> Result<()> {
        if self.engine.is_some() {
            return Err(EngineError::InvalidState(format!(
                "cannot register {} after the engine is loaded",
                name
            )));
        }
        if element_size == 0 || dims.rank() == 0 || dims.volume() == 0 {
            return Err(EngineError::InvalidInput(format!(
                "binding {} must have a non-empty shape and element size, got [{}] x{}",
                name, dims, element_size
            )));
        }
        if self.inputs.iter().chain(&self.outputs).any(|b| b.name == name) {
            return Err(EngineError::InvalidInput(format!("binding {} is already registered", name)));
        }

        let binding = NetworkBinding::new(name, dims, element_size, role);
        match role {
            Role::Input => self.inputs.push(binding),
            Role::Output => self.outputs.push(binding),
        }
        Ok(())
    }

    fn ensure_unloaded(&self) -> Result<()> {
        match self.engine {
            Some(_) => Err(EngineError::InvalidState("an engine is already loaded".into())),
            None => Ok(()),
        }
    }

    /// ビルド・読み込みしたエンジンを取り付け，デバイスバッファを確保します。
    fn install(&mut self, engine: CompiledEngine) -> Result<()> {
        for role in [Role::Input, Role::Output] {
            self.pool.acquire(self.device.as_mut(), role, engine.buffer_bytes(role))?;
        }
        info!("{}", engine.summary().trim_end());
        self.engine = Some(engine);
        Ok(())
    }
}

impl Engine for InferenceEngine {
    fn add_input(&mut self, name: &str, dims: Dims, element_size: usize) -> Result<()> {
        self.register(Role::Input, name, dims, element_size)
    }

    fn add_output(&mut self, name: &str, dims: Dims, element_size: usize) -> Result<()> {
        self.register(Role::Output, name, dims, element_size)
    }

    fn load_model(&mut self, model: &Path, weights: &Path, options: &BuildOptions) -> Result<()> {
        self.ensure_unloaded()?;
        let network = self.parser.parse(model, weights)?;
        let engine = EngineCompiler::new(self.device.name(), self.device.capabilities()).compile(
            &network,
            &self.bindings(),
            options,
        )?;
        self.install(engine)
    }

    fn load_cache(&mut self, path: &Path, max_batch_size: usize) -> Result<()> {
        self.ensure_unloaded()?;
        let engine = cache::load(path, &self.bindings(), max_batch_size)?;
        if !self.device.capabilities().supports(engine.precision()) {
            return Err(EngineError::UnsupportedPrecision {
                precision: engine.precision(),
                device: self.device.name().to_string(),
            });
        }
        self.install(engine)
    }

    fn save_cache(&self, path: &Path) -> Result<()> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| EngineError::InvalidState("no engine to save".into()))?;
        cache::save(path, engine)
    }

    fn predict(&mut self, batch: &[Vec<Vec<u8>>]) -> Result<Vec<Vec<Vec<u8>>>> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| EngineError::InvalidState("load a model or cache before predict".into()))?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if batch.len() > engine.max_batch_size() {
            return Err(EngineError::BatchSizeExceeded {
                requested: batch.len(),
                max: engine.max_batch_size(),
            });
        }

        let in_offsets = engine.binding_offsets(Role::Input);
        let out_offsets = engine.binding_offsets(Role::Output);
        for (b, sample) in batch.iter().enumerate() {
            if sample.len() != in_offsets.len() {
                return Err(EngineError::InvalidInput(format!(
                    "sample {} has {} input buffers, {} bindings registered",
                    b,
                    sample.len(),
                    in_offsets.len()
                )));
            }
            for (buf, &(j, _)) in sample.iter().zip(&in_offsets) {
                let binding = &engine.bindings()[j];
                if buf.len() != binding.sample_bytes() {
                    return Err(EngineError::InvalidInput(format!(
                        "sample {}: {} needs {} bytes, got {}",
                        b,
                        binding.name,
                        binding.sample_bytes(),
                        buf.len()
                    )));
                }
            }
        }

        let start = Instant::now();
        let device = self.device.as_mut();

        let input = self.pool.acquire(device, Role::Input, engine.buffer_bytes(Role::Input))?;
        for (b, sample) in batch.iter().enumerate() {
            for (buf, &(j, offset)) in sample.iter().zip(&in_offsets) {
                let n = engine.bindings()[j].sample_bytes();
                device.upload(buf, input, offset + b * n)?;
            }
        }

        self.pool.acquire(device, Role::Output, engine.buffer_bytes(Role::Output))?;
        match self.pool.split_mut() {
            (Some(input), Some(output)) => device.execute(engine, batch.len(), input, output)?,
            _ => return Err(EngineError::InvalidState("device buffers are not allocated".into())),
        }

        let output = self
            .pool
            .get(Role::Output)
            .ok_or_else(|| EngineError::InvalidState("output buffer is not allocated".into()))?;
        let mut results = Vec::with_capacity(batch.len());
        for b in 0..batch.len() {
            let mut sample = Vec::with_capacity(out_offsets.len());
            for &(j, offset) in &out_offsets {
                let n = engine.bindings()[j].sample_bytes();
                let mut host = vec![0u8; n];
                device.download(output, offset + b * n, &mut host)?;
                sample.push(host);
            }
            results.push(sample);
        }

        debug!("predict of {} samples took {:?}", batch.len(), start.elapsed());
        Ok(results)
    }
}
