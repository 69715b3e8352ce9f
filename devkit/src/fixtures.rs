/*!
Lignes nvidia-smi synthétiques

Reproduisent le format CSV `noheader,nounit(s)` de `dmon -s pucvmet`,
`--query-gpu` et du listing des GPUs, pour tester sans carte NVIDIA.
*/

/// Colonnes de `nvidia-smi dmon -s pucvmet`, dans l'ordre de sortie
pub const DMON_COLUMNS: [&str; 22] = [
    "id", "pwr", "gtemp", "mtemp", "sm", "mem", "enc", "dec", "jpg", "ofa", "mclk", "pclk", "pviol", "tviol",
    "fb", "bar1", "ccpm", "sbecc", "dbecc", "pci", "rxpci", "txpci",
];

/// Ligne `dmon` à zéro sauf les colonnes surchargées
///
/// Les colonnes inconnues sont ignorées. Les valeurs sont alignées à droite
/// comme dans la vraie sortie.
pub fn dmon_line(overrides: &[(&str, i64)]) -> String {
    DMON_COLUMNS
        .iter()
        .map(|column| {
            let value = overrides
                .iter()
                .rev()
                .find(|(name, _)| name == column)
                .map(|(_, value)| *value)
                .unwrap_or(0);
            format!("{:>5}", value)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Ligne `--query-gpu=utilization.gpu,memory.used,memory.free,driver_version,fan.speed,pstate`
pub fn query_line(utilization: i64, pstate: &str) -> String {
    format!("{}, 1024, 23552, 550.54.14, 30, {}", utilization, pstate)
}

/// Sortie de `--query-gpu index,gpu_name,gpu_uuid`
pub fn gpu_list(gpus: &[(u32, &str, &str)]) -> String {
    gpus.iter()
        .map(|(index, name, uuid)| format!("{}, {}, {}\n", index, name, uuid))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dmon_line_shape() {
        let line = dmon_line(&[("pwr", 55), ("txpci", 12), ("unknown", 9)]);
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();

        assert_eq!(fields.len(), DMON_COLUMNS.len());
        assert_eq!(fields[1], "55");
        assert_eq!(fields[21], "12");
        assert!(fields.iter().enumerate().all(|(i, f)| i == 1 || i == 21 || *f == "0"));
    }

    #[test]
    fn test_query_line_shape() {
        let line = query_line(87, "P0");
        assert_eq!(line.split(',').count(), 6);
        assert!(line.starts_with("87,"));
        assert!(line.ends_with(" P0"));
    }

    #[test]
    fn test_gpu_list() {
        let listing = gpu_list(&[(0, "Tesla T4", "GPU-aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee")]);
        assert_eq!(listing, "0, Tesla T4, GPU-aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee\n");
    }
}
