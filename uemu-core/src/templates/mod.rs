//! Text assets written into provisioned images.
//!
//! Rendering is plain placeholder substitution; values are inserted verbatim.

const SNAPPY_SYSTEM: &str = include_str!("snappy-system.txt.tmpl");
const EMULATOR_LANGUAGE: &str = include_str!("emulator-language.conf.tmpl");

/// Bootloader variables for the kernel and initrd file names, plus an optional
/// `fdtfile=` line (empty when the platform has no device tree).
pub fn render_snappy_system(kernel: &str, initrd: &str, fdt: &str) -> String {
    SNAPPY_SYSTEM
        .replace("{{kernel}}", kernel)
        .replace("{{initrd}}", initrd)
        .replace("{{fdt}}", fdt)
}

/// Upstart session job that applies `locale` on first boot.
pub fn render_locale_job(locale: &str) -> String {
    EMULATOR_LANGUAGE.replace("{{locale}}", locale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snappy_system_substitutes_fields() {
        let out = render_snappy_system("vmlinuz", "initrd.img", "fdtfile=am335x-boneblack.dtb");
        assert!(out.contains("\nkernel_file=vmlinuz\n"));
        assert!(out.contains("\ninitrd_file=initrd.img\n"));
        assert!(out.contains("\nfdtfile=am335x-boneblack.dtb\n"));
        assert!(out.contains("${snappy_ab}/${kernel_file}"));
        assert!(!out.contains("{{"));
    }

    #[test]
    fn snappy_system_without_fdt_leaves_blank_line() {
        let out = render_snappy_system("vmlinuz", "initrd.img", "");
        assert!(out.contains("initrd_file=initrd.img\n\n\n# extra kernel cmdline"));
    }

    #[test]
    fn locale_inserted_five_times_verbatim() {
        let out = render_locale_job("es_AR.utf8");
        assert_eq!(out.matches("es_AR.utf8").count(), 5);
        assert!(out.contains("setenv LANGUAGE es_AR.utf8\n"));
        assert!(out.contains("SetLanguage string:es_AR.utf8\n"));
        assert!(out.contains("\"@a{ss} {'$1': '$2'}\""));
    }
}
