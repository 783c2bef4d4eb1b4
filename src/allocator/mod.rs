// Allocator module - Port ranges, service ports and limit validation
//
// These are pure functions over the current tables; callers run them inside a
// store write transaction so the pick and the insert are one atomic step.

use crate::config::{LimitPolicy, PortPoolConfig};
use crate::error::{HostplaneError, Result};
use crate::model::{PortRange, ResourceLimits, Service, Site};
use std::collections::HashSet;

/// Pick the lowest free block of `width` ports from the global pool
pub fn allocate_range<'a, I>(sites: I, pool: &PortPoolConfig, width: u16) -> Result<PortRange>
where
    I: IntoIterator<Item = &'a Site>,
{
    if width == 0 || width > pool.max_range_width {
        return Err(HostplaneError::Validation(format!(
            "Port count must be between 1 and {}",
            pool.max_range_width
        )));
    }

    let mut taken: Vec<PortRange> = sites
        .into_iter()
        .filter(|s| s.status.holds_ports())
        .map(|s| s.port_range)
        .collect();
    taken.sort_by_key(|r| r.start);

    let mut candidate = pool.pool_start as u32;
    for range in &taken {
        if candidate + width as u32 <= range.start as u32 {
            break;
        }
        if (range.end as u32) > candidate {
            candidate = range.end as u32;
        }
    }

    let end = candidate + width as u32;
    if end > pool.pool_end as u32 {
        return Err(HostplaneError::ResourceExhausted(format!(
            "No free block of {} ports left in pool {}-{}",
            width, pool.pool_start, pool.pool_end
        )));
    }

    Ok(PortRange::new(candidate as u16, end as u16))
}

/// Pick the lowest port of the site's range not used by one of its services
pub fn allocate_port<'a, I>(site: &Site, services: I) -> Result<u16>
where
    I: IntoIterator<Item = &'a Service>,
{
    let used = used_ports(site, services);

    site.port_range
        .ports()
        .find(|p| !used.contains(p))
        .ok_or_else(|| {
            HostplaneError::ResourceExhausted(format!(
                "All {} ports of site {} ({}) are assigned",
                site.port_range.len(),
                site.name,
                site.port_range
            ))
        })
}

/// Validate an explicitly requested service port
pub fn claim_port<'a, I>(site: &Site, services: I, port: u16) -> Result<u16>
where
    I: IntoIterator<Item = &'a Service>,
{
    if !site.port_range.contains(port) {
        return Err(HostplaneError::Validation(format!(
            "Port {} is outside the range of site {} ({})",
            port, site.name, site.port_range
        )));
    }

    if used_ports(site, services).contains(&port) {
        return Err(HostplaneError::Validation(format!(
            "Port {} is already assigned in site {}",
            port, site.name
        )));
    }

    Ok(port)
}

fn used_ports<'a, I>(site: &Site, services: I) -> HashSet<u16>
where
    I: IntoIterator<Item = &'a Service>,
{
    services
        .into_iter()
        .filter(|s| s.site_id == site.id)
        .map(|s| s.port)
        .collect()
}

/// Reject limit values outside the configured policy
pub fn validate_limits(request: &ResourceLimits, policy: &LimitPolicy) -> Result<()> {
    if let Some(memory) = request.memory_mb {
        if memory < policy.min_memory_mb || memory > policy.max_memory_mb {
            return Err(HostplaneError::Validation(format!(
                "memory_mb must be between {} and {}, got {}",
                policy.min_memory_mb, policy.max_memory_mb, memory
            )));
        }
    }

    if let Some(cpu) = request.cpu_percent {
        if cpu == 0 || cpu > policy.max_cpu_percent {
            return Err(HostplaneError::Validation(format!(
                "cpu_percent must be between 1 and {}, got {}",
                policy.max_cpu_percent, cpu
            )));
        }
    }

    if let Some(procs) = request.max_processes {
        if procs == 0 || procs > policy.max_processes {
            return Err(HostplaneError::Validation(format!(
                "max_processes must be between 1 and {}, got {}",
                policy.max_processes, procs
            )));
        }
    }

    Ok(())
}

/// Reject service limits that exceed the owning site's limits
pub fn validate_within(service: &ResourceLimits, site: &ResourceLimits) -> Result<()> {
    fn check<T: PartialOrd + std::fmt::Display>(
        name: &str,
        service: Option<T>,
        site: Option<T>,
    ) -> Result<()> {
        if let (Some(service), Some(site)) = (service, site) {
            if service > site {
                return Err(HostplaneError::Validation(format!(
                    "{} of {} exceeds the site limit of {}",
                    name, service, site
                )));
            }
        }
        Ok(())
    }

    check("memory_mb", service.memory_mb, site.memory_mb)?;
    check("cpu_percent", service.cpu_percent, site.cpu_percent)?;
    check("max_processes", service.max_processes, site.max_processes)
}
