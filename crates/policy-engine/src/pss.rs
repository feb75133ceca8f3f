//! Pod Security Standards checks: the baseline and restricted control
//! tables applied to a pod (or pod-template carrying) resource.
//!
//! Each control inspects the pod spec and reports zero or more violations
//! with the offending field path and, for container-scoped controls, the
//! container image. Exclusions suppress violations by control name,
//! optionally narrowed to matching images.

use k8s_openapi::api::core::v1::{Container, PodSpec};
use serde_json::Value;

use crate::context::EvaluationContext;
use crate::errors::EngineError;
use crate::policy::{PodSecurity, PodSecurityExclusion, PodSecurityLevel};
use crate::response::PodSecurityCheck;
use crate::validate::Verdict;
use crate::wildcard::wildcard_match;

const BASELINE_CAPABILITIES: [&str; 12] = [
    "AUDIT_WRITE",
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "FSETID",
    "KILL",
    "MKNOD",
    "NET_BIND_SERVICE",
    "SETFCAP",
    "SETGID",
    "SETPCAP",
    "SETUID",
];

const ALLOWED_SYSCTLS: [&str; 10] = [
    "kernel.shm_rmid_forced",
    "net.ipv4.ip_local_port_range",
    "net.ipv4.ip_local_reserved_ports",
    "net.ipv4.ip_unprivileged_port_start",
    "net.ipv4.ping_group_range",
    "net.ipv4.tcp_fin_timeout",
    "net.ipv4.tcp_keepalive_intvl",
    "net.ipv4.tcp_keepalive_probes",
    "net.ipv4.tcp_keepalive_time",
    "net.ipv4.tcp_syncookies",
];

const ALLOWED_SELINUX_TYPES: [&str; 4] = [
    "container_t",
    "container_init_t",
    "container_kvm_t",
    "container_engine_t",
];

/// Volume fields the restricted profile allows, besides `name`.
const RESTRICTED_VOLUME_KEYS: [&str; 8] = [
    "configMap",
    "csi",
    "downwardAPI",
    "emptyDir",
    "ephemeral",
    "persistentVolumeClaim",
    "projected",
    "secret",
];

/// Evaluate the configured profile against the resource currently bound in
/// the context. The verdict carries a formatted violation list; the raw
/// checks are returned alongside for the rule response.
pub fn check_pod_security(
    ctx: &EvaluationContext,
    config: &PodSecurity,
) -> Result<(Verdict, Vec<PodSecurityCheck>), EngineError> {
    let Some(resource) = ctx.resource() else {
        return Ok((
            Verdict::Skip("the request carries no resource to validate".to_string()),
            Vec::new(),
        ));
    };

    let (spec_value, prefix) = pod_spec_value(resource)
        .ok_or_else(|| EngineError::NotAPodSpec("no spec or spec.template.spec".to_string()))?;
    let spec: PodSpec = serde_json::from_value(spec_value.clone())
        .map_err(|e| EngineError::NotAPodSpec(e.to_string()))?;

    let mut violations = collect_violations(&spec, spec_value, &prefix, config.level);
    violations.retain(|check| !excluded(check, &config.exclude));

    if violations.is_empty() {
        return Ok((Verdict::Pass, violations));
    }
    let summary = violations
        .iter()
        .map(|v| format!("{} ({})", v.message, v.field))
        .collect::<Vec<_>>()
        .join("; ");
    Ok((
        Verdict::Fail(format!(
            "pod security \"{}\" profile violated: {summary}",
            level_name(config.level)
        )),
        violations,
    ))
}

fn level_name(level: PodSecurityLevel) -> &'static str {
    match level {
        PodSecurityLevel::Baseline => "baseline",
        PodSecurityLevel::Restricted => "restricted",
    }
}

/// Locate the pod spec inside a Pod, a pod-template controller or a
/// CronJob, returning it with the field-path prefix for reporting.
fn pod_spec_value(resource: &Value) -> Option<(&Value, String)> {
    let kind = resource.get("kind").and_then(Value::as_str).unwrap_or("");
    match kind {
        "Pod" => resource.get("spec").map(|s| (s, "spec".to_string())),
        "CronJob" => resource
            .pointer("/spec/jobTemplate/spec/template/spec")
            .map(|s| (s, "spec.jobTemplate.spec.template.spec".to_string())),
        _ => resource
            .pointer("/spec/template/spec")
            .map(|s| (s, "spec.template.spec".to_string()))
            .or_else(|| resource.get("spec").map(|s| (s, "spec".to_string()))),
    }
}

fn excluded(check: &PodSecurityCheck, exclusions: &[PodSecurityExclusion]) -> bool {
    exclusions.iter().any(|exclusion| {
        if exclusion.control_name != check.control {
            return false;
        }
        if exclusion.images.is_empty() {
            return true;
        }
        match &check.image {
            Some(image) => exclusion
                .images
                .iter()
                .any(|pattern| wildcard_match(pattern, image)),
            None => false,
        }
    })
}

fn collect_violations(
    spec: &PodSpec,
    spec_value: &Value,
    prefix: &str,
    level: PodSecurityLevel,
) -> Vec<PodSecurityCheck> {
    let mut out = Vec::new();

    check_host_namespaces(spec, prefix, &mut out);
    check_sysctls(spec, prefix, &mut out);
    check_pod_selinux(spec, prefix, &mut out);
    check_pod_seccomp(spec, prefix, level, &mut out);
    check_host_path_volumes(spec_value, prefix, &mut out);

    for (container, path) in containers_of(spec, prefix) {
        check_privileged(&container, &path, &mut out);
        check_capabilities(&container, &path, level, &mut out);
        check_host_ports(&container, &path, &mut out);
        check_container_selinux(&container, &path, &mut out);
        check_proc_mount(&container, &path, &mut out);
        check_apparmor(&container, &path, &mut out);
        check_container_seccomp(&container, &path, level, &mut out);
        if level == PodSecurityLevel::Restricted {
            check_privilege_escalation(&container, &path, &mut out);
            check_run_as_nonroot(spec, &container, &path, &mut out);
            check_run_as_user(&container, &path, &mut out);
        }
    }

    if level == PodSecurityLevel::Restricted {
        check_volume_types(spec_value, prefix, &mut out);
    }

    out
}

fn containers_of(spec: &PodSpec, prefix: &str) -> Vec<(Container, String)> {
    let mut out = Vec::new();
    for (i, c) in spec.containers.iter().enumerate() {
        out.push((c.clone(), format!("{prefix}.containers[{i}]")));
    }
    if let Some(init) = &spec.init_containers {
        for (i, c) in init.iter().enumerate() {
            out.push((c.clone(), format!("{prefix}.initContainers[{i}]")));
        }
    }
    out
}

fn violation(control: &str, field: String, image: Option<&str>, message: &str) -> PodSecurityCheck {
    PodSecurityCheck {
        control: control.to_string(),
        field,
        image: image.map(str::to_string),
        message: message.to_string(),
    }
}

fn check_host_namespaces(spec: &PodSpec, prefix: &str, out: &mut Vec<PodSecurityCheck>) {
    for (flag, field) in [
        (spec.host_network, "hostNetwork"),
        (spec.host_pid, "hostPID"),
        (spec.host_ipc, "hostIPC"),
    ] {
        if flag == Some(true) {
            out.push(violation(
                "Host Namespaces",
                format!("{prefix}.{field}"),
                None,
                "sharing host namespaces is disallowed",
            ));
        }
    }
}

fn check_sysctls(spec: &PodSpec, prefix: &str, out: &mut Vec<PodSecurityCheck>) {
    let Some(sysctls) = spec
        .security_context
        .as_ref()
        .and_then(|sc| sc.sysctls.as_ref())
    else {
        return;
    };
    for (i, sysctl) in sysctls.iter().enumerate() {
        if !ALLOWED_SYSCTLS.contains(&sysctl.name.as_str()) {
            out.push(violation(
                "Sysctls",
                format!("{prefix}.securityContext.sysctls[{i}].name"),
                None,
                &format!("sysctl \"{}\" is disallowed", sysctl.name),
            ));
        }
    }
}

fn selinux_violates(options: &k8s_openapi::api::core::v1::SELinuxOptions) -> Option<&'static str> {
    if let Some(type_) = &options.type_ {
        if !type_.is_empty() && !ALLOWED_SELINUX_TYPES.contains(&type_.as_str()) {
            return Some("seLinuxOptions type is disallowed");
        }
    }
    if options.user.is_some() {
        return Some("setting the seLinuxOptions user is disallowed");
    }
    if options.role.is_some() {
        return Some("setting the seLinuxOptions role is disallowed");
    }
    None
}

fn check_pod_selinux(spec: &PodSpec, prefix: &str, out: &mut Vec<PodSecurityCheck>) {
    if let Some(options) = spec
        .security_context
        .as_ref()
        .and_then(|sc| sc.se_linux_options.as_ref())
    {
        if let Some(message) = selinux_violates(options) {
            out.push(violation(
                "SELinux",
                format!("{prefix}.securityContext.seLinuxOptions"),
                None,
                message,
            ));
        }
    }
}

fn check_container_selinux(container: &Container, path: &str, out: &mut Vec<PodSecurityCheck>) {
    if let Some(options) = container
        .security_context
        .as_ref()
        .and_then(|sc| sc.se_linux_options.as_ref())
    {
        if let Some(message) = selinux_violates(options) {
            out.push(violation(
                "SELinux",
                format!("{path}.securityContext.seLinuxOptions"),
                container.image.as_deref(),
                message,
            ));
        }
    }
}

fn seccomp_violates(type_: &str, level: PodSecurityLevel) -> Option<&'static str> {
    match level {
        PodSecurityLevel::Baseline if type_ == "Unconfined" => {
            Some("seccomp profile must not be unconfined")
        }
        PodSecurityLevel::Restricted
            if type_ != "RuntimeDefault" && type_ != "Localhost" =>
        {
            Some("seccomp profile must be RuntimeDefault or Localhost")
        }
        _ => None,
    }
}

fn check_pod_seccomp(
    spec: &PodSpec,
    prefix: &str,
    level: PodSecurityLevel,
    out: &mut Vec<PodSecurityCheck>,
) {
    let type_ = spec
        .security_context
        .as_ref()
        .and_then(|sc| sc.seccomp_profile.as_ref())
        .map(|p| p.type_.as_str());
    match type_ {
        Some(type_) => {
            if let Some(message) = seccomp_violates(type_, level) {
                out.push(violation(
                    "Seccomp",
                    format!("{prefix}.securityContext.seccompProfile.type"),
                    None,
                    message,
                ));
            }
        }
        // restricted requires an explicit profile at pod level unless every
        // container sets its own; the container walk reports those
        None => {}
    }
}

fn check_container_seccomp(
    container: &Container,
    path: &str,
    level: PodSecurityLevel,
    out: &mut Vec<PodSecurityCheck>,
) {
    if let Some(profile) = container
        .security_context
        .as_ref()
        .and_then(|sc| sc.seccomp_profile.as_ref())
    {
        if let Some(message) = seccomp_violates(&profile.type_, level) {
            out.push(violation(
                "Seccomp",
                format!("{path}.securityContext.seccompProfile.type"),
                container.image.as_deref(),
                message,
            ));
        }
    }
}

fn check_host_path_volumes(spec_value: &Value, prefix: &str, out: &mut Vec<PodSecurityCheck>) {
    let Some(volumes) = spec_value.get("volumes").and_then(Value::as_array) else {
        return;
    };
    for (i, volume) in volumes.iter().enumerate() {
        if volume.get("hostPath").is_some() {
            let name = volume.get("name").and_then(Value::as_str).unwrap_or("");
            out.push(violation(
                "HostPath Volumes",
                format!("{prefix}.volumes[{i}].hostPath"),
                None,
                &format!("hostPath volume \"{name}\" is disallowed"),
            ));
        }
    }
}

fn check_volume_types(spec_value: &Value, prefix: &str, out: &mut Vec<PodSecurityCheck>) {
    let Some(volumes) = spec_value.get("volumes").and_then(Value::as_array) else {
        return;
    };
    for (i, volume) in volumes.iter().enumerate() {
        let Some(map) = volume.as_object() else { continue };
        for key in map.keys() {
            if key == "name" || RESTRICTED_VOLUME_KEYS.contains(&key.as_str()) {
                continue;
            }
            out.push(violation(
                "Volume Types",
                format!("{prefix}.volumes[{i}].{key}"),
                None,
                &format!("volume type \"{key}\" is disallowed by the restricted profile"),
            ));
        }
    }
}

fn check_privileged(container: &Container, path: &str, out: &mut Vec<PodSecurityCheck>) {
    let privileged = container
        .security_context
        .as_ref()
        .and_then(|sc| sc.privileged);
    if privileged == Some(true) {
        out.push(violation(
            "Privileged Containers",
            format!("{path}.securityContext.privileged"),
            container.image.as_deref(),
            "privileged containers are disallowed",
        ));
    }
}

fn check_capabilities(
    container: &Container,
    path: &str,
    level: PodSecurityLevel,
    out: &mut Vec<PodSecurityCheck>,
) {
    let capabilities = container
        .security_context
        .as_ref()
        .and_then(|sc| sc.capabilities.as_ref());

    if let Some(added) = capabilities.and_then(|c| c.add.as_ref()) {
        for capability in added {
            let allowed = match level {
                PodSecurityLevel::Baseline => {
                    BASELINE_CAPABILITIES.contains(&capability.as_str())
                }
                PodSecurityLevel::Restricted => capability == "NET_BIND_SERVICE",
            };
            if !allowed {
                out.push(violation(
                    "Capabilities",
                    format!("{path}.securityContext.capabilities.add"),
                    container.image.as_deref(),
                    &format!("adding capability \"{capability}\" is disallowed"),
                ));
            }
        }
    }

    if level == PodSecurityLevel::Restricted {
        let drops_all = capabilities
            .and_then(|c| c.drop.as_ref())
            .map(|dropped| dropped.iter().any(|c| c == "ALL"))
            .unwrap_or(false);
        if !drops_all {
            out.push(violation(
                "Capabilities",
                format!("{path}.securityContext.capabilities.drop"),
                container.image.as_deref(),
                "containers must drop ALL capabilities",
            ));
        }
    }
}

fn check_host_ports(container: &Container, path: &str, out: &mut Vec<PodSecurityCheck>) {
    let Some(ports) = &container.ports else { return };
    for (i, port) in ports.iter().enumerate() {
        if matches!(port.host_port, Some(p) if p != 0) {
            out.push(violation(
                "Host Ports",
                format!("{path}.ports[{i}].hostPort"),
                container.image.as_deref(),
                "host ports are disallowed",
            ));
        }
    }
}

fn check_proc_mount(container: &Container, path: &str, out: &mut Vec<PodSecurityCheck>) {
    let proc_mount = container
        .security_context
        .as_ref()
        .and_then(|sc| sc.proc_mount.as_deref());
    if matches!(proc_mount, Some(mount) if mount != "Default") {
        out.push(violation(
            "/proc Mount Type",
            format!("{path}.securityContext.procMount"),
            container.image.as_deref(),
            "only the default /proc mount is allowed",
        ));
    }
}

fn check_apparmor(container: &Container, path: &str, out: &mut Vec<PodSecurityCheck>) {
    let type_ = container
        .security_context
        .as_ref()
        .and_then(|sc| sc.app_armor_profile.as_ref())
        .map(|p| p.type_.as_str());
    if type_ == Some("Unconfined") {
        out.push(violation(
            "AppArmor",
            format!("{path}.securityContext.appArmorProfile.type"),
            container.image.as_deref(),
            "the AppArmor profile must not be unconfined",
        ));
    }
}

fn check_privilege_escalation(
    container: &Container,
    path: &str,
    out: &mut Vec<PodSecurityCheck>,
) {
    let allow = container
        .security_context
        .as_ref()
        .and_then(|sc| sc.allow_privilege_escalation);
    if allow != Some(false) {
        out.push(violation(
            "Privilege Escalation",
            format!("{path}.securityContext.allowPrivilegeEscalation"),
            container.image.as_deref(),
            "allowPrivilegeEscalation must be set to false",
        ));
    }
}

fn check_run_as_nonroot(
    spec: &PodSpec,
    container: &Container,
    path: &str,
    out: &mut Vec<PodSecurityCheck>,
) {
    let container_setting = container
        .security_context
        .as_ref()
        .and_then(|sc| sc.run_as_non_root);
    let pod_setting = spec
        .security_context
        .as_ref()
        .and_then(|sc| sc.run_as_non_root);
    // the container setting overrides the pod setting; the effective value
    // must be an explicit true
    if container_setting.or(pod_setting) != Some(true) {
        out.push(violation(
            "Running as Non-root",
            format!("{path}.securityContext.runAsNonRoot"),
            container.image.as_deref(),
            "containers must set runAsNonRoot to true",
        ));
    }
}

fn check_run_as_user(container: &Container, path: &str, out: &mut Vec<PodSecurityCheck>) {
    let run_as_user = container
        .security_context
        .as_ref()
        .and_then(|sc| sc.run_as_user);
    if run_as_user == Some(0) {
        out.push(violation(
            "Running as Non-root user",
            format!("{path}.securityContext.runAsUser"),
            container.image.as_deref(),
            "running as the root user is disallowed",
        ));
    }
}
