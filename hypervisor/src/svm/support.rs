//! Checks whether the current system is able to run guests.

use crate::svm::msr::{SVM_MSR_VM_CR, SVM_VM_CR_SVMDIS};
use x86::{cpuid::CpuId, msr::rdmsr};

/// Checks whether svm is supported by the processor.
///
/// # Recommended Algorithm
/// This algorithm has been taken from section `15.4 Enabling SVM` from the AMD
/// manual.
/// ```pseudocode
/// if (CPUID Fn8000_0001_ECX[SVM] == 0)
///     return SVM_NOT_AVAIL;
///
/// if (VM_CR.SVMDIS == 0)
///     return SVM_ALLOWED;
///
/// if (CPUID Fn8000_000A_EDX[SVML]==0)
///     return SVM_DISABLED_AT_BIOS_NOT_UNLOCKABLE
/// else
///     return SVM_DISABLED_WITH_KEY;
/// ```
pub fn is_svm_supported() -> bool {
    // Check `CPUID Fn8000_0001_ECX[SVM] == 0`
    //
    let Some(result) = CpuId::new().get_extended_processor_and_feature_identifiers() else { return false };
    if !result.has_svm() {
        log::warn!("Processor does not support SVM");
        return false;
    }

    // Guests always run with nested paging.
    //
    let nested_paging = CpuId::new()
        .get_svm_info()
        .map(|svm_info| svm_info.has_nested_paging())
        .unwrap_or_default();
    if !nested_paging {
        log::warn!("Processor does not support nested paging");
        return false;
    }

    // Check `VM_CR.SVMDIS == 0`
    //
    let vm_cr = unsafe { rdmsr(SVM_MSR_VM_CR) };
    if (vm_cr & SVM_VM_CR_SVMDIS) == 0 {
        return true;
    }

    // Check `CPUID Fn8000_000A_EDX[SVML]==0`
    //
    if CpuId::new()
        .get_svm_info()
        .map(|svm_info| svm_info.has_svm_lock())
        .unwrap_or_default()
    {
        log::warn!(
            "SVM is locked at BIOS level. You must change a platform firmware setting to enable \
             SVM."
        );
    } else {
        log::warn!("SVMLock may be unlockable; consult platform firmware or TPM to obtain the key.");
    }

    false
}

/// Number of address space identifiers, `CPUID Fn8000_000A_EBX`. ASID 0 is the host.
pub fn max_asid() -> u32 {
    CpuId::new()
        .get_svm_info()
        .map(|svm_info| svm_info.supported_asids())
        .unwrap_or_default()
}
