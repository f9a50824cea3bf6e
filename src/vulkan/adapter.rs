// Adapter selection and queue family role assignment
//
// Every enumerated physical adapter is judged against a fixed battery of
// predicates; survivors are partitioned discrete/other and the first
// discrete one wins. Rejections are accumulated per adapter, per predicate,
// because a failed selection is undebuggable from outside otherwise.

use std::collections::HashSet;

use ash::vk;

use crate::error::DeviceManagerError;

/// Facts about one queue family, derived once per adapter during selection.
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    pub supports_present: bool,
}

/// Role assignment produced by scanning an adapter's queue families.
///
/// Graphics and present are always resolved; compute and transfer are
/// resolved when a dedicated family exists, and their absence only fails
/// resolution when the caller requested the corresponding queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyAssignment {
    pub graphics: u32,
    pub present: u32,
    pub compute: Option<u32>,
    pub transfer: Option<u32>,
}

impl QueueFamilyAssignment {
    /// Single pass over the families in index order, fixed role priority,
    /// first match wins. Compute wants a family without graphics; transfer
    /// wants a family with neither graphics nor compute. Present is judged
    /// independently of the capability flags and may coincide with any
    /// other role.
    pub fn resolve(
        families: &[QueueFamilyInfo],
        need_compute: bool,
        need_transfer: bool,
    ) -> Option<Self> {
        let mut graphics = None;
        let mut compute = None;
        let mut transfer = None;
        let mut present = None;

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if family.queue_count == 0 {
                continue;
            }

            if graphics.is_none() && family.flags.contains(vk::QueueFlags::GRAPHICS) {
                graphics = Some(index);
            }

            if compute.is_none()
                && family.flags.contains(vk::QueueFlags::COMPUTE)
                && !family.flags.contains(vk::QueueFlags::GRAPHICS)
            {
                compute = Some(index);
            }

            if transfer.is_none()
                && family.flags.contains(vk::QueueFlags::TRANSFER)
                && !family
                    .flags
                    .intersects(vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS)
            {
                transfer = Some(index);
            }

            if present.is_none() && family.supports_present {
                present = Some(index);
            }
        }

        if need_compute && compute.is_none() {
            return None;
        }
        if need_transfer && transfer.is_none() {
            return None;
        }

        Some(Self {
            graphics: graphics?,
            present: present?,
            compute,
            transfer,
        })
    }

    /// Deduplicated family indices that need a queue-create descriptor,
    /// sorted for deterministic device creation.
    pub fn unique_families(&self, need_compute: bool, need_transfer: bool) -> Vec<u32> {
        let mut set: HashSet<u32> = [self.graphics, self.present].into();
        if need_compute {
            if let Some(family) = self.compute {
                set.insert(family);
            }
        }
        if need_transfer {
            if let Some(family) = self.transfer {
                set.insert(family);
            }
        }
        let mut families: Vec<u32> = set.into_iter().collect();
        families.sort_unstable();
        families
    }
}

/// Surface limits reported by an adapter, reduced to what selection needs.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceCaps {
    pub min_image_count: u32,
    /// Zero means the adapter reports no upper bound.
    pub max_image_count: u32,
    pub min_image_extent: vk::Extent2D,
    pub max_image_extent: vk::Extent2D,
}

/// Everything selection needs to know about one physical adapter.
/// Computed once during selection and discarded afterwards.
#[derive(Debug, Clone)]
pub struct AdapterFacts {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub extensions: HashSet<String>,
    pub sampler_anisotropy: bool,
    pub texture_compression_bc: bool,
    pub surface_caps: SurfaceCaps,
    pub surface_formats: Vec<vk::Format>,
    pub queue_families: Vec<QueueFamilyInfo>,
}

/// What every adapter is judged against.
#[derive(Debug, Clone)]
pub struct AdapterRequirements {
    pub required_device_extensions: HashSet<String>,
    pub surface_format: vk::Format,
    pub back_buffer_count: u32,
    pub extent: vk::Extent2D,
    pub need_compute_queue: bool,
    pub need_transfer_queue: bool,
}

/// Runs the full predicate battery over one adapter. Returns the queue
/// assignment on success, or every failure in evaluation order.
pub fn evaluate_adapter(
    facts: &AdapterFacts,
    req: &AdapterRequirements,
) -> Result<QueueFamilyAssignment, Vec<String>> {
    let mut failures = Vec::new();

    let mut missing: Vec<&String> = req
        .required_device_extensions
        .difference(&facts.extensions)
        .collect();
    missing.sort();
    for ext in missing {
        failures.push(format!("missing {}", ext));
    }

    if !facts.sampler_anisotropy {
        failures.push("does not support samplerAnisotropy".to_string());
    }
    if !facts.texture_compression_bc {
        failures.push("does not support textureCompressionBC".to_string());
    }

    let caps = &facts.surface_caps;
    if caps.min_image_count > req.back_buffer_count
        || (caps.max_image_count > 0 && caps.max_image_count < req.back_buffer_count)
    {
        failures.push(format!(
            "cannot support the requested swap chain image count: requested {}, available {} - {}",
            req.back_buffer_count, caps.min_image_count, caps.max_image_count
        ));
    }

    if caps.min_image_extent.width > req.extent.width
        || caps.min_image_extent.height > req.extent.height
        || caps.max_image_extent.width < req.extent.width
        || caps.max_image_extent.height < req.extent.height
    {
        failures.push(format!(
            "cannot support the requested swap chain size: requested {}x{}, available {}x{} - {}x{}",
            req.extent.width,
            req.extent.height,
            caps.min_image_extent.width,
            caps.min_image_extent.height,
            caps.max_image_extent.width,
            caps.max_image_extent.height
        ));
    }

    if !facts.surface_formats.contains(&req.surface_format) {
        failures.push("does not support the requested swap chain format".to_string());
    }

    match QueueFamilyAssignment::resolve(
        &facts.queue_families,
        req.need_compute_queue,
        req.need_transfer_queue,
    ) {
        Some(assignment) => {
            let graphics_presents = facts
                .queue_families
                .get(assignment.graphics as usize)
                .map_or(false, |family| family.supports_present);
            if !graphics_presents {
                failures.push("cannot present from the graphics queue".to_string());
            }
            if failures.is_empty() {
                return Ok(assignment);
            }
            Err(failures)
        }
        None => {
            failures.push("does not support the necessary queue types".to_string());
            Err(failures)
        }
    }
}

/// Picks the first discrete adapter that passes every predicate, else the
/// first non-discrete one. On total failure the error carries the
/// accumulated per-adapter report.
pub fn select_adapter(
    candidates: &[AdapterFacts],
    req: &AdapterRequirements,
) -> Result<(usize, QueueFamilyAssignment), DeviceManagerError> {
    let mut report = String::new();
    let mut discrete = None;
    let mut other = None;

    for (index, facts) in candidates.iter().enumerate() {
        match evaluate_adapter(facts, req) {
            Ok(assignment) => {
                if facts.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                    if discrete.is_none() {
                        discrete = Some((index, assignment));
                    }
                } else if other.is_none() {
                    other = Some((index, assignment));
                }
            }
            Err(failures) => {
                report.push_str(&format!("\n{}:", facts.name));
                for failure in failures {
                    report.push_str(&format!("\n  - {}", failure));
                }
            }
        }
    }

    discrete
        .or(other)
        .ok_or(DeviceManagerError::Selection { report })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, supports_present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo {
            flags,
            queue_count: 1,
            supports_present,
        }
    }

    fn combined_family() -> QueueFamilyInfo {
        family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            true,
        )
    }

    fn facts(name: &str, device_type: vk::PhysicalDeviceType) -> AdapterFacts {
        AdapterFacts {
            name: name.to_string(),
            device_type,
            extensions: ["VK_KHR_swapchain".to_string(), "VK_KHR_maintenance1".to_string()].into(),
            sampler_anisotropy: true,
            texture_compression_bc: true,
            surface_caps: SurfaceCaps {
                min_image_count: 2,
                max_image_count: 8,
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
            },
            surface_formats: vec![vk::Format::B8G8R8A8_SRGB, vk::Format::B8G8R8A8_UNORM],
            queue_families: vec![combined_family()],
        }
    }

    fn requirements() -> AdapterRequirements {
        AdapterRequirements {
            required_device_extensions: ["VK_KHR_swapchain".to_string()].into(),
            surface_format: vk::Format::B8G8R8A8_SRGB,
            back_buffer_count: 3,
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            need_compute_queue: false,
            need_transfer_queue: false,
        }
    }

    #[test]
    fn resolver_prefers_dedicated_compute_and_transfer_families() {
        let families = vec![
            combined_family(),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, false),
            family(vk::QueueFlags::TRANSFER, false),
        ];
        let assignment = QueueFamilyAssignment::resolve(&families, true, true).unwrap();
        assert_eq!(assignment.graphics, 0);
        assert_eq!(assignment.present, 0);
        assert_eq!(assignment.compute, Some(1));
        assert_eq!(assignment.transfer, Some(2));
    }

    #[test]
    fn resolver_is_deterministic() {
        let families = vec![
            family(vk::QueueFlags::TRANSFER, false),
            combined_family(),
            family(vk::QueueFlags::COMPUTE, true),
        ];
        let first = QueueFamilyAssignment::resolve(&families, true, true);
        let second = QueueFamilyAssignment::resolve(&families, true, true);
        assert_eq!(first, second);
        let assignment = first.unwrap();
        assert_eq!(assignment.graphics, 1);
        assert_eq!(assignment.transfer, Some(0));
        assert_eq!(assignment.compute, Some(2));
    }

    #[test]
    fn later_matching_families_are_ignored_once_a_role_is_assigned() {
        let families = vec![
            family(vk::QueueFlags::COMPUTE, false),
            family(vk::QueueFlags::COMPUTE, false),
            combined_family(),
        ];
        let assignment = QueueFamilyAssignment::resolve(&families, true, false).unwrap();
        assert_eq!(assignment.compute, Some(0));
    }

    #[test]
    fn compute_queue_only_required_when_requested() {
        // Only a combined graphics/compute family exists, so no dedicated
        // compute family can be assigned.
        let families = vec![combined_family()];
        assert!(QueueFamilyAssignment::resolve(&families, false, false).is_some());
        assert!(QueueFamilyAssignment::resolve(&families, true, false).is_none());
    }

    #[test]
    fn resolution_fails_without_graphics_or_present() {
        let no_graphics = vec![family(vk::QueueFlags::COMPUTE, true)];
        assert!(QueueFamilyAssignment::resolve(&no_graphics, false, false).is_none());

        let no_present = vec![family(vk::QueueFlags::GRAPHICS, false)];
        assert!(QueueFamilyAssignment::resolve(&no_present, false, false).is_none());
    }

    #[test]
    fn families_with_zero_queues_are_skipped() {
        let families = vec![
            QueueFamilyInfo {
                flags: vk::QueueFlags::GRAPHICS,
                queue_count: 0,
                supports_present: true,
            },
            combined_family(),
        ];
        let assignment = QueueFamilyAssignment::resolve(&families, false, false).unwrap();
        assert_eq!(assignment.graphics, 1);
    }

    #[test]
    fn unique_families_deduplicates_and_respects_requests() {
        let assignment = QueueFamilyAssignment {
            graphics: 0,
            present: 0,
            compute: Some(1),
            transfer: Some(2),
        };
        assert_eq!(assignment.unique_families(false, false), vec![0]);
        assert_eq!(assignment.unique_families(true, true), vec![0, 1, 2]);
    }

    #[test]
    fn missing_required_extension_is_named_in_the_failure() {
        let mut req = requirements();
        req.required_device_extensions.insert("X".to_string());
        let failures = evaluate_adapter(&facts("gpu0", vk::PhysicalDeviceType::DISCRETE_GPU), &req)
            .unwrap_err();
        assert!(failures.iter().any(|f| f == "missing X"));
    }

    #[test]
    fn unbounded_max_image_count_accepts_any_request() {
        let mut adapter = facts("gpu0", vk::PhysicalDeviceType::DISCRETE_GPU);
        adapter.surface_caps.max_image_count = 0;
        let mut req = requirements();
        req.back_buffer_count = 16;
        assert!(evaluate_adapter(&adapter, &req).is_ok());
    }

    #[test]
    fn out_of_range_extent_is_rejected() {
        let mut req = requirements();
        req.extent = vk::Extent2D {
            width: 8192,
            height: 8192,
        };
        let failures = evaluate_adapter(&facts("gpu0", vk::PhysicalDeviceType::DISCRETE_GPU), &req)
            .unwrap_err();
        assert!(failures
            .iter()
            .any(|f| f.contains("cannot support the requested swap chain size")));
    }

    #[test]
    fn graphics_family_must_present() {
        let mut adapter = facts("gpu0", vk::PhysicalDeviceType::DISCRETE_GPU);
        adapter.queue_families = vec![
            family(vk::QueueFlags::GRAPHICS, false),
            family(vk::QueueFlags::COMPUTE, true),
        ];
        let failures = evaluate_adapter(&adapter, &requirements()).unwrap_err();
        assert!(failures
            .iter()
            .any(|f| f == "cannot present from the graphics queue"));
    }

    #[test]
    fn integrated_adapter_wins_over_broken_discrete_one() {
        let mut discrete = facts("discrete", vk::PhysicalDeviceType::DISCRETE_GPU);
        discrete.sampler_anisotropy = false;
        let integrated = facts("integrated", vk::PhysicalDeviceType::INTEGRATED_GPU);

        let (index, _) = select_adapter(&[discrete, integrated], &requirements()).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn healthy_discrete_adapter_wins_over_integrated_one() {
        let integrated = facts("integrated", vk::PhysicalDeviceType::INTEGRATED_GPU);
        let discrete = facts("discrete", vk::PhysicalDeviceType::DISCRETE_GPU);

        let (index, _) = select_adapter(&[integrated, discrete], &requirements()).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn total_failure_reports_every_adapter_and_predicate() {
        let mut first = facts("alpha", vk::PhysicalDeviceType::DISCRETE_GPU);
        first.texture_compression_bc = false;
        let mut second = facts("beta", vk::PhysicalDeviceType::INTEGRATED_GPU);
        second.extensions.remove("VK_KHR_swapchain");
        second.surface_formats.clear();

        let err = select_adapter(&[first, second], &requirements()).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("alpha"));
        assert!(text.contains("does not support textureCompressionBC"));
        assert!(text.contains("beta"));
        assert!(text.contains("missing VK_KHR_swapchain"));
        assert!(text.contains("does not support the requested swap chain format"));
    }
}
