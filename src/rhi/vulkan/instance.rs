use std::{
    ffi::{CStr, c_char, c_void},
    sync::Arc,
};

use ash::{ext::debug_utils, khr::surface, vk};
use raw_window_handle::RawDisplayHandle;
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use crate::rhi::{
    backend::{DebugFlags, DeviceType},
    command::QueueClass,
    error::{NativeResultExt, RhiError, RhiResult},
    loader::{LibraryRef, SharedLibrary},
    swapchain::NativeWindow,
};

static ENTRY: SharedLibrary<ash::Entry> = SharedLibrary::new("Vulkan loader");

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub(super) struct VkInstance {
    pub(super) surface_fn: surface::Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub(super) raw: ash::Instance,
    pub(super) entry: LibraryRef<ash::Entry>,
}

impl VkInstance {
    pub(super) fn new(display: RawDisplayHandle, debug_flags: DebugFlags) -> RhiResult<Arc<Self>> {
        let entry = ENTRY.acquire(|| {
            unsafe { ash::Entry::load() }.map_err(|err| RhiError::BackendUnavailable {
                backend: DeviceType::Vulkan,
                reason: format!("failed to load the Vulkan loader: {err}").into(),
            })
        })?;

        let mut extensions = ash_window::enumerate_required_extensions(display)
            .map_err(|err| RhiError::BackendUnavailable {
                backend: DeviceType::Vulkan,
                reason: format!("display is not supported: {err:?}").into(),
            })?
            .to_vec();

        let mut layers = SmallVec::<[*const c_char; 1]>::new();

        if !debug_flags.is_empty() {
            extensions.push(debug_utils::NAME.as_ptr());
        }

        if debug_flags.contains(DebugFlags::CpuValidation) {
            let available = unsafe { entry.enumerate_instance_layer_properties() }
                .native("vkEnumerateInstanceLayerProperties")?;

            let found = available
                .iter()
                .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER);

            if found {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                warn!("{:?} is not installed, validation is off", VALIDATION_LAYER);
            }
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"tessera")
            .engine_name(c"tessera")
            .api_version(vk::API_VERSION_1_3);

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let raw = unsafe { entry.create_instance(&create_info, None) }.map_err(|err| match err {
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => RhiError::BackendUnavailable {
                backend: DeviceType::Vulkan,
                reason: "no Vulkan 1.3 capable driver".into(),
            },
            err => RhiError::native("vkCreateInstance", err),
        })?;

        let mut instance = Self {
            surface_fn: surface::Instance::new(&entry, &raw),
            debug: None,
            raw,
            entry,
        };

        if !debug_flags.is_empty() {
            let debug_fn = debug_utils::Instance::new(&instance.entry, &instance.raw);

            let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));

            let messenger = unsafe { debug_fn.create_debug_utils_messenger(&info, None) }
                .native("vkCreateDebugUtilsMessengerEXT")?;
            instance.debug = Some((debug_fn, messenger));
        }

        Ok(Arc::new(instance))
    }

    /// Picks the best adapter that can drive all three queue classes and
    /// present to `surface`. Discrete GPUs win over integrated ones.
    pub(super) fn pick_adapter(&self, surface: vk::SurfaceKHR) -> RhiResult<Adapter> {
        let physical_devices = unsafe { self.raw.enumerate_physical_devices() }
            .native("vkEnumeratePhysicalDevices")?;

        let mut best: Option<(u32, Adapter)> = None;

        for physical in physical_devices {
            let props = unsafe { self.raw.get_physical_device_properties(physical) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();

            if props.api_version < vk::API_VERSION_1_3 {
                debug!("Skipping {}: Vulkan 1.3 is not supported", name);
                continue;
            }

            let families = unsafe {
                self.raw
                    .get_physical_device_queue_family_properties(physical)
            };
            let Some(families) = QueueFamilies::select(&families) else {
                debug!("Skipping {}: no graphics queue", name);
                continue;
            };

            let can_present = unsafe {
                self.surface_fn.get_physical_device_surface_support(
                    physical,
                    families.graphics,
                    surface,
                )
            }
            .unwrap_or(false);
            if !can_present {
                debug!("Skipping {}: graphics queue cannot present", name);
                continue;
            }

            info!("Found adapter: {} ({:?})", name, props.device_type);

            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 3,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
                vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
                _ => 0,
            };

            if best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((
                    score,
                    Adapter {
                        physical,
                        name,
                        families,
                    },
                ));
            }
        }

        best.map(|(_, adapter)| adapter)
            .ok_or_else(|| RhiError::BackendUnavailable {
                backend: DeviceType::Vulkan,
                reason: "no Vulkan 1.3 adapter can present to this window".into(),
            })
    }
}

impl Drop for VkInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_fn, messenger)) = self.debug.take() {
                debug_fn.destroy_debug_utils_messenger(messenger, None);
            }

            self.raw.destroy_instance(None);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Adapter {
    pub physical: vk::PhysicalDevice,
    pub name: String,
    pub families: QueueFamilies,
}

/// Queue family index per queue class. Compute and copy fall back to a
/// shared family when the device has no dedicated one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub copy: u32,
}

impl QueueFamilies {
    pub(super) fn select(props: &[vk::QueueFamilyProperties]) -> Option<Self> {
        let find = |pred: &dyn Fn(u32, vk::QueueFlags) -> bool| {
            props
                .iter()
                .zip(0u32..)
                .find(|(p, i)| p.queue_count > 0 && pred(*i, p.queue_flags))
                .map(|(_, i)| i)
        };

        let graphics = find(&|_, flags| flags.contains(vk::QueueFlags::GRAPHICS))?;
        let compute = find(&|i, flags| i != graphics && flags.contains(vk::QueueFlags::COMPUTE))
            .unwrap_or(graphics);
        let copy = find(&|i, flags| {
            i != graphics && i != compute && flags.contains(vk::QueueFlags::TRANSFER)
        })
        .unwrap_or(compute);

        Some(Self {
            graphics,
            compute,
            copy,
        })
    }

    pub fn get(&self, class: QueueClass) -> u32 {
        match class {
            QueueClass::Graphics => self.graphics,
            QueueClass::Copy => self.copy,
            QueueClass::Compute => self.compute,
        }
    }
}

pub(super) struct Surface {
    pub(super) raw: vk::SurfaceKHR,
    instance: Arc<VkInstance>,
}

impl Surface {
    pub(super) fn new(instance: &Arc<VkInstance>, window: &NativeWindow) -> RhiResult<Self> {
        let raw = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.raw,
                window.display,
                window.window,
                None,
            )
        }
        .native("vkCreateSurfaceKHR")?;

        Ok(Self {
            raw,
            instance: Arc::clone(instance),
        })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.instance.surface_fn.destroy_surface(self.raw, None) };
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || unsafe { (*data).p_message.is_null() } {
        return vk::FALSE;
    }

    let msg = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!("[Vulkan Validation] {}", msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("[Vulkan Validation] {}", msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => info!("[Vulkan Validation] {}", msg),
        _ => debug!("[Vulkan Validation] {}", msg),
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];

        assert_eq!(
            QueueFamilies::select(&families),
            Some(QueueFamilies {
                graphics: 0,
                compute: 1,
                copy: 2,
            })
        );
    }

    #[test]
    fn single_family_serves_every_class() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];

        let selected = QueueFamilies::select(&families).unwrap();

        for class in QueueClass::ALL {
            assert_eq!(selected.get(class), 0);
        }
    }

    #[test]
    fn copy_falls_back_to_async_compute() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];

        let selected = QueueFamilies::select(&families).unwrap();

        assert_eq!(selected.compute, 1);
        assert_eq!(selected.copy, 1);
    }

    #[test]
    fn no_graphics_family_is_rejected() {
        let families = [family(vk::QueueFlags::COMPUTE)];

        assert_eq!(QueueFamilies::select(&families), None);
    }
}
