// Vulkan device stack - instance, surface, GPU selection, logical device
//
// One owner for everything beneath the swapchain. Drop unwinds in order:
// device, surface, debug messenger, instance.

use anyhow::{anyhow, Context, Result};
use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle};
use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::sync::Arc;
use thiserror::Error;
use winit::window::Window;

use super::swapchain::SwapchainSupport;

/// No enumerated GPU passed the suitability checks.
#[derive(Debug, Error)]
#[error("no suitable GPU found")]
pub struct NoSuitableDeviceError;

/// Queue family indices discovered per role. Selection needs both; they may
/// name the same family.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }
}

/// Resolved indices for the selected device.
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

/// Additive score for a candidate GPU. A device without geometry-shader
/// support scores zero and is never selected.
pub fn rate_device(
    properties: &vk::PhysicalDeviceProperties,
    features: &vk::PhysicalDeviceFeatures,
) -> u32 {
    if features.geometry_shader != vk::TRUE {
        return 0;
    }

    let mut score = 0;
    if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        score += 1000;
    }
    score + properties.limits.max_image_dimension2_d
}

/// Highest score wins; ties keep the earlier entry, zero never wins.
pub fn select_highest(scores: impl IntoIterator<Item = (usize, u32)>) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (index, score) in scores {
        if score == 0 {
            continue;
        }
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index)
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queue_families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: Surface,
    pub instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    _entry: Entry,

    // Memory properties (cached for allocation-time type lookups)
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Build the whole device stack against the given window's surface.
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> Result<Arc<Self>> {
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let instance = Self::create_instance(&entry, app_name, enable_validation, display_handle)?;

        // From here on a failed step must destroy whatever instance-level
        // state already exists before returning.
        let mut debug_utils = None;
        if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(pair) => debug_utils = Some(pair),
                Err(e) => {
                    unsafe { unwind_instance(&instance, &mut debug_utils, None) };
                    return Err(e);
                }
            }
        }

        let surface_loader = Surface::new(&entry, &instance);
        let surface = match unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        } {
            Ok(surface) => surface,
            Err(e) => {
                unsafe { unwind_instance(&instance, &mut debug_utils, None) };
                return Err(e).context("Failed to create window surface");
            }
        };

        let (physical_device, queue_families) =
            match Self::pick_physical_device(&instance, &surface_loader, surface) {
                Ok(picked) => picked,
                Err(e) => {
                    unsafe {
                        unwind_instance(
                            &instance,
                            &mut debug_utils,
                            Some((&surface_loader, surface)),
                        )
                    };
                    return Err(e);
                }
            };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let (device, graphics_queue, present_queue) =
            match Self::create_logical_device(&instance, physical_device, queue_families) {
                Ok(built) => built,
                Err(e) => {
                    unsafe {
                        unwind_instance(
                            &instance,
                            &mut debug_utils,
                            Some((&surface_loader, surface)),
                        )
                    };
                    return Err(e);
                }
            };

        Ok(Arc::new(Self {
            device,
            physical_device,
            queue_families,
            graphics_queue,
            present_queue,
            surface,
            surface_loader,
            instance,
            debug_utils,
            _entry: entry,
            memory_properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("trigon")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        // Window-system extensions, plus debug utils when validation is on
        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Windowing system offers no Vulkan surface extensions")?
            .to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    /// Enumerate, filter by suitability, score, and keep the best.
    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate GPUs")?;

        let mut rated = Vec::new();
        for (index, &device) in devices.iter().enumerate() {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            if !Self::is_device_suitable(instance, surface_loader, device, surface)? {
                log::debug!("GPU {} ({}): unsuitable", index, name);
                continue;
            }

            let features = unsafe { instance.get_physical_device_features(device) };
            let score = rate_device(&props, &features);
            log::debug!("GPU {} ({}): score {}", index, name, score);
            rated.push((index, score));
        }

        let best = select_highest(rated.iter().copied()).ok_or(NoSuitableDeviceError)?;
        let physical_device = devices[best];
        let best_score = rated
            .iter()
            .find(|&&(index, _)| index == best)
            .map_or(0, |&(_, score)| score);

        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {} (score {})",
            unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy(),
            best_score
        );

        let indices =
            Self::find_queue_families(instance, surface_loader, physical_device, surface)?;
        let (Some(graphics), Some(present)) = (indices.graphics, indices.present) else {
            return Err(anyhow!(NoSuitableDeviceError));
        };

        Ok((physical_device, QueueFamilies { graphics, present }))
    }

    /// Suitable means: required extensions present, both queue families
    /// found, and the surface advertises at least one format and one
    /// present mode.
    fn is_device_suitable(
        instance: &ash::Instance,
        surface_loader: &Surface,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<bool> {
        if !Self::check_device_extension_support(instance, device)? {
            return Ok(false);
        }

        let indices = Self::find_queue_families(instance, surface_loader, device, surface)?;
        if !indices.is_complete() {
            return Ok(false);
        }

        let support = SwapchainSupport::query(surface_loader, device, surface)?;
        Ok(support.is_adequate())
    }

    fn check_device_extension_support(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
    ) -> Result<bool> {
        let available = unsafe { instance.enumerate_device_extension_properties(device) }?;
        let required = [SwapchainLoader::name()];

        Ok(required.iter().all(|&needed| {
            available.iter().any(|ext| {
                let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
                name == needed
            })
        }))
    }

    /// First family per role wins; the roles may land on the same family.
    fn find_queue_families(
        instance: &ash::Instance,
        surface_loader: &Surface,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<QueueFamilyIndices> {
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut indices = QueueFamilyIndices::default();
        for (index, family) in families.iter().enumerate() {
            let index = index as u32;

            if indices.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            {
                indices.graphics = Some(index);
            }

            if indices.present.is_none() {
                let supported = unsafe {
                    surface_loader.get_physical_device_surface_support(device, index, surface)?
                };
                if supported {
                    indices.present = Some(index);
                }
            }

            if indices.is_complete() {
                break;
            }
        }

        Ok(indices)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilies,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        // One create info per unique family; graphics and present usually
        // coincide and the driver rejects duplicates
        let unique_families: HashSet<u32> = [queue_families.graphics, queue_families.present]
            .into_iter()
            .collect();

        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = unique_families
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = [SwapchainLoader::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    /// Wait for the GPU to finish all submitted work.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device");

        let _ = self.wait_idle();

        // Device first, then surface, messenger, instance last
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Destroys whatever instance-level state exists when a later setup step
/// fails, surface first, instance last.
unsafe fn unwind_instance(
    instance: &ash::Instance,
    debug_utils: &mut Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface: Option<(&Surface, vk::SurfaceKHR)>,
) {
    if let Some((loader, surface)) = surface {
        loader.destroy_surface(surface, None);
    }
    if let Some((utils, messenger)) = debug_utils.take() {
        utils.destroy_debug_utils_messenger(messenger, None);
    }
    instance.destroy_instance(None);
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(
        device_type: vk::PhysicalDeviceType,
        max_dimension: u32,
    ) -> vk::PhysicalDeviceProperties {
        vk::PhysicalDeviceProperties {
            device_type,
            limits: vk::PhysicalDeviceLimits {
                max_image_dimension2_d: max_dimension,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn with_geometry() -> vk::PhysicalDeviceFeatures {
        vk::PhysicalDeviceFeatures {
            geometry_shader: vk::TRUE,
            ..Default::default()
        }
    }

    #[test]
    fn score_is_discrete_bonus_plus_max_dimension() {
        let features = with_geometry();
        let discrete = gpu(vk::PhysicalDeviceType::DISCRETE_GPU, 4096);
        let integrated = gpu(vk::PhysicalDeviceType::INTEGRATED_GPU, 4096);
        assert_eq!(rate_device(&discrete, &features), 5096);
        assert_eq!(rate_device(&integrated, &features), 4096);
    }

    #[test]
    fn larger_max_dimension_wins_between_discrete_gpus() {
        let features = with_geometry();
        let large = gpu(vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        let small = gpu(vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        assert!(rate_device(&large, &features) > rate_device(&small, &features));
    }

    #[test]
    fn missing_geometry_shader_scores_zero() {
        let discrete = gpu(vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        assert_eq!(
            rate_device(&discrete, &vk::PhysicalDeviceFeatures::default()),
            0
        );
    }

    #[test]
    fn highest_score_is_selected() {
        assert_eq!(select_highest([(0, 10), (1, 300), (2, 42)]), Some(1));
    }

    #[test]
    fn ties_keep_the_first_candidate() {
        assert_eq!(select_highest([(0, 100), (1, 100), (2, 100)]), Some(0));
    }

    #[test]
    fn zero_scores_never_win() {
        assert_eq!(select_highest([(0, 0), (1, 0)]), None);
        assert_eq!(select_highest([]), None);
    }

    #[test]
    fn a_single_candidate_is_selected_whatever_its_score() {
        assert_eq!(select_highest([(3, 1)]), Some(3));
    }

    #[test]
    fn completeness_requires_both_roles() {
        let mut indices = QueueFamilyIndices::default();
        assert!(!indices.is_complete());
        indices.graphics = Some(0);
        assert!(!indices.is_complete());
        indices.present = Some(1);
        assert!(indices.is_complete());
    }

    #[test]
    fn required_surface_extensions_follow_the_display_handle() {
        use ash::extensions::khr::{WaylandSurface, XlibSurface};
        use raw_window_handle::{WaylandDisplayHandle, XlibDisplayHandle};

        fn extension_names(display: RawDisplayHandle) -> Vec<&'static CStr> {
            ash_window::enumerate_required_extensions(display)
                .unwrap()
                .iter()
                .map(|&name| unsafe { CStr::from_ptr(name) })
                .collect()
        }

        let xlib = extension_names(RawDisplayHandle::Xlib(XlibDisplayHandle::empty()));
        assert!(xlib.contains(&Surface::name()));
        assert!(xlib.contains(&XlibSurface::name()));

        let wayland = extension_names(RawDisplayHandle::Wayland(WaylandDisplayHandle::empty()));
        assert!(wayland.contains(&Surface::name()));
        assert!(wayland.contains(&WaylandSurface::name()));
    }
}
