use oxidx::dx::{
    self, IAdapter3, IDebug, IDebug1, IDebugExt, IDevice, IFactory4, IFactory6,
    features::Architecture1Feature,
};
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use crate::rhi::{
    backend::{DebugFlags, DeviceType},
    error::{NativeResultExt, RhiError, RhiResult},
    loader::{LibraryRef, SharedLibrary},
};

/// The D3D12 debug layer is process-wide: enabled by the first device that
/// asks for validation and released with the last one.
pub(super) struct DebugLayer {
    _raw: dx::Debug1,
}

// The debug interface is only touched behind the library lock.
unsafe impl Send for DebugLayer {}
unsafe impl Sync for DebugLayer {}

static DEBUG_LAYER: SharedLibrary<DebugLayer> = SharedLibrary::new("D3D12 debug layer");

impl std::fmt::Debug for DebugLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugLayer").finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct AdapterInfo {
    pub name: String,
    pub id: usize,
    pub is_uma: bool,
    pub is_software: bool,
}

#[derive(Debug)]
pub(super) struct DxFactory {
    pub(super) factory: dx::Factory4,
    pub(super) debug: Option<LibraryRef<DebugLayer>>,
}

impl DxFactory {
    pub(super) fn new(debug_flags: DebugFlags) -> RhiResult<Self> {
        let debug = if debug_flags.contains(DebugFlags::CpuValidation) {
            Some(DEBUG_LAYER.acquire(|| enable_debug_layer(debug_flags))?)
        } else {
            None
        };

        let flags = if !debug_flags.is_empty() {
            dx::FactoryCreationFlags::Debug
        } else {
            dx::FactoryCreationFlags::empty()
        };

        let factory = dx::create_factory4(flags).map_err(|err| RhiError::BackendUnavailable {
            backend: DeviceType::Dx12,
            reason: format!("CreateDXGIFactory2 failed: {err:?}").into(),
        })?;

        Ok(Self { factory, debug })
    }

    /// Enumerates hardware adapters, high-performance ones first when the
    /// factory can order them. Software adapters go last.
    pub(super) fn adapters(&self) -> SmallVec<[(dx::Adapter3, AdapterInfo); 4]> {
        let mut adapters = SmallVec::<[_; 4]>::new();

        if let Ok(factory) = TryInto::<dx::Factory7>::try_into(self.factory.clone()) {
            debug!("Factory7 is supported");

            let mut i = 0;
            while let Ok(adapter) =
                factory.enum_adapters_by_gpu_preference(i, dx::GpuPreference::HighPerformance)
            {
                if let Some(info) = probe_adapter(&adapter, i) {
                    adapters.push((adapter, info));
                }
                i += 1;
            }
        } else {
            let mut i = 0;
            while let Ok(adapter) = self.factory.enum_adapters(i) {
                if let Some(info) = probe_adapter(&adapter, i) {
                    adapters.push((adapter, info));
                }
                i += 1;
            }
        }

        adapters.sort_by_key(|(_, info)| info.is_software);
        adapters
            .iter()
            .for_each(|(_, info)| info!("Found adapter: {:?}", info));

        adapters
    }
}

fn enable_debug_layer(debug_flags: DebugFlags) -> RhiResult<DebugLayer> {
    let debug: dx::Debug1 = dx::create_debug()
        .native("D3D12GetDebugInterface")?
        .try_into()
        .native("ID3D12Debug1 cast")?;

    debug.enable_debug_layer();

    if debug_flags.contains(DebugFlags::GpuValidation) {
        debug.set_enable_gpu_based_validation(true);
    }

    debug.set_callback(Box::new(|_, severity, _, msg| match severity {
        dx::MessageSeverity::Corruption => error!("[D3D12 Validation] {}", msg),
        dx::MessageSeverity::Error => error!("[D3D12 Validation] {}", msg),
        dx::MessageSeverity::Warning => warn!("[D3D12 Validation] {}", msg),
        dx::MessageSeverity::Info => info!("[D3D12 Validation] {}", msg),
        dx::MessageSeverity::Message => debug!("[D3D12 Validation] {}", msg),
    }));

    Ok(DebugLayer { _raw: debug })
}

fn probe_adapter(adapter: &dx::Adapter3, id: usize) -> Option<AdapterInfo> {
    let desc = adapter.get_desc1().ok()?;
    let device = dx::create_device(Some(adapter), dx::FeatureLevel::Level11).ok()?;

    let mut hardware = Architecture1Feature::new(0);
    let is_uma = device
        .check_feature_support(&mut hardware)
        .map(|_| hardware.uma())
        .unwrap_or(false);

    Some(AdapterInfo {
        name: desc.description().trim_matches('\0').to_string(),
        id,
        is_uma,
        is_software: desc.flags().contains(dx::AdapterFlags::Sofware),
    })
}
