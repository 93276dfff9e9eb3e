use std::sync::Arc;

use primconv::library::PrimitiveLibrary;
use primconv_backend_faer::FaerLibrary;

primconv_backend_tests::define_library_tests!(faer_library, || -> Arc<dyn PrimitiveLibrary> {
    Arc::new(FaerLibrary::new())
});
